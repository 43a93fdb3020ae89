//! In-process binary patching with trampolines, and LPC interception for the
//! Windows console API.
//!
//! This crate patches the entry preamble of an already-loaded function so
//! calls divert to a replacement, optionally leaving behind a trampoline that
//! still invokes the original behaviour, and it uses that same machinery to
//! intercept `NtRequestWaitReplyPort` and calibrate itself against the
//! console LPC server. It has no opinion about what a replacement function
//! does, how the host process talks to the rest of the system, or what "the
//! console" means semantically — those are the caller's problem.

pub mod call_guard;
pub mod disasm;
pub mod isa;
pub mod lpc;
pub mod memory;
pub mod patch;
pub mod redirect;

pub use call_guard::{Disable, InterceptGuardState};
pub use disasm::{Disassembler, ResolveStatus};
pub use lpc::{
    disable_guard, install_lpc_interceptor, uninstall_lpc_interceptor, Destination, LpcHandler,
    Message,
};
pub use memory::MemoryManager;
pub use patch::{PatchRequest, PatchRequestFlags, PatchSet, PatchStatus};
pub use redirect::Redirection;

/// Re-exported so callers constructing [`PatchRequest`]s or handling LPC
/// interception errors don't need a direct dependency on `shared` just for
/// the error types.
pub use shared::errors::{LpcError, PatchError};
