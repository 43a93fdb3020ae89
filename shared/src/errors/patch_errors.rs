use thiserror::Error;

/// Errors that can abort a [`PatchSet`](../../patch_core/patch/struct.PatchSet.html) apply/revert.
///
/// Every variant carries the failing address or opcode where applicable, per
/// the diagnostic-surface requirement: these are meant to help debug
/// calibration/patching assumptions on a new Windows build, not just to
/// report pass/fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The OS refused a requested page-permission transition.
    #[error("page permission denied at {address:#x} ({length} bytes)")]
    PagePermissionDenied { address: usize, length: usize },

    /// No executable memory could be placed within the instruction set's
    /// proximity window of `anchor`.
    #[error("no memory in reach of anchor {anchor:#x} for {size} bytes")]
    NoMemoryInReach { anchor: usize, size: usize },

    /// The disassembler could not decode the bytes at `address`.
    #[error("undecodable preamble at {address:#x} (offset {offset})")]
    UndecodablePreamble { address: usize, offset: usize },

    /// A decoded instruction is not on the relocation whitelist.
    #[error("unrelocatable preamble at {address:#x} (offset {offset}, opcode {opcode:#x})")]
    UnrelocatablePreamble {
        address: usize,
        offset: usize,
        opcode: u8,
    },

    /// No redirection strategy could satisfy the request's constraints.
    #[error(
        "redirect out of range: original {original:#x}, replacement {replacement:#x}, distance {distance:#x}"
    )]
    RedirectOutOfRange {
        original: usize,
        replacement: usize,
        distance: i64,
    },

    /// The read/write round-trip validation failed after the page was
    /// reportedly opened for writing.
    #[error("write validation failed at {address:#x}")]
    WriteValidationFailed { address: usize },
}
