use thiserror::Error;

use super::PatchError;

/// Errors that can abort [`install_lpc_interceptor`](../../patch_core/lpc/fn.install_lpc_interceptor.html).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LpcError {
    /// Installing the underlying patch on `NtRequestWaitReplyPort` failed.
    #[error("failed to install LPC patch: {0}")]
    Patch(#[from] PatchError),

    /// The guided-inference and caller-body-scan strategies for locating
    /// `ConsoleClientCallServer` both succeeded but disagreed.
    #[error("calibration mismatch: guided inferred {guided:#x}, body scan inferred {body_scan:#x}")]
    CalibrationMismatch { guided: usize, body_scan: usize },

    /// Neither inference strategy produced an address for `ConsoleClientCallServer`.
    #[error("calibration failed: no inference strategy located ConsoleClientCallServer")]
    CalibrationFailed,

    /// The provoking call (`GetConsoleCP` or `GetProcessShutdownParameters`)
    /// did not arrive at the intercepted entry point within the configured
    /// timeout.
    #[error("calibration timed out waiting for phase {phase}")]
    CalibrationTimeout { phase: &'static str },
}
