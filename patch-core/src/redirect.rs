//! The redirection strategies a [`PatchRequest`](crate::patch::PatchRequest)
//! can end up using, and the tie-break between them.

/// Which redirect shape was chosen for a given request, decided once the
/// request's preamble has been measured and its target distance known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirection {
    /// `E9 <rel32>` written directly into the original function.
    Rel32,
    /// x86-64 only: the architecture's absolute-jump sequence written
    /// directly into the original function. Requires a preamble at least as
    /// long as that sequence.
    Abs64,
    /// `E9 <rel32>` into the original, jumping to a nearby stub that holds
    /// the architecture's absolute-jump sequence to the real replacement.
    /// Used when the replacement is unreachable by a direct rel32/abs64
    /// redirect, or when the caller explicitly bans rel32 for testing.
    Kangaroo,
}

impl Redirection {
    /// Whether this strategy needs a stub to carry an absolute-jump island,
    /// separate from the trampoline's resume jump.
    pub fn needs_kangaroo_stub(self) -> bool {
        matches!(self, Redirection::Kangaroo)
    }
}
