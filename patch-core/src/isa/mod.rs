//! Architecture-specific code emission: redirect writer, trampoline writer,
//! proximity requirements, preamble validator.
//!
//! One implementation per (OS, ISA) is swapped in at build time rather than
//! through virtual dispatch, since the variant is known when the crate is
//! compiled, not at runtime: [`X64`] and
//! [`Ia32`] are plain structs implementing the same [`InstructionSet`] trait,
//! and [`ActiveInstructionSet`] resolves to whichever one matches the target
//! via `cfg(target_pointer_width)`.

mod ia32;
mod x64;

pub use ia32::Ia32;
pub use x64::X64;

use crate::disasm::{Disassembler, ResolveStatus};
use crate::redirect::Redirection;
use shared::errors::PatchError;

/// The size, in bytes, of the saved preamble buffer on a [`PatchRequest`](crate::patch::PatchRequest).
pub const MAX_PREAMBLE: usize = 32;

/// Architecture-specific operations needed by the patch set: disassembling a
/// preamble, picking a redirection strategy, and writing the redirect and
/// trampoline bytes.
pub trait InstructionSet {
    /// 32 or 64.
    fn bitness(&self) -> u32;

    /// Size in bytes of the short redirect (`E9 <rel32>`), used both as a
    /// direct redirect and as the jump to a kangaroo stub. 5 on every
    /// architecture this crate supports.
    fn redirect_size_bytes(&self) -> usize {
        5
    }

    /// Size in bytes of this architecture's absolute-jump sequence: 13 on
    /// x86-64 (`mov r11, imm64 ; jmp r11`), 7 on IA-32 (`mov eax, imm32 ;
    /// jmp eax`). Used for the kangaroo stub's jump island on both
    /// architectures, and additionally as a direct redirect on x86-64 only.
    fn absolute_jump_size_bytes(&self) -> usize;

    /// Whether this architecture supports writing the absolute-jump
    /// sequence directly into the original function (the `abs64` strategy).
    /// IA-32 does not: an out-of-range redirect there must go through
    /// kangaroo instead.
    fn supports_direct_absolute(&self) -> bool;

    fn disassembler(&self) -> &Disassembler;

    /// Accumulates whole instructions from offset 0 until their combined
    /// length covers the redirect-size threshold, failing if any instruction
    /// along the way is undecodable or not on the relocation whitelist.
    fn preamble_size(&self, original_address: usize, original_bytes: &[u8]) -> Result<usize, PatchError> {
        let threshold = self.redirect_size_bytes().max(self.absolute_jump_size_bytes());
        let mut offset = 0usize;
        while offset < threshold {
            let resolution = self.disassembler().resolve(original_bytes, offset);
            match resolution.status {
                ResolveStatus::Resolved => offset += resolution.length,
                ResolveStatus::NotWhitelisted { .. } => {
                    return Err(PatchError::UnrelocatablePreamble {
                        address: original_address,
                        offset,
                        opcode: original_bytes.get(offset).copied().unwrap_or(0),
                    })
                }
                ResolveStatus::InvalidInstruction => {
                    return Err(PatchError::UndecodablePreamble {
                        address: original_address,
                        offset,
                    })
                }
            }
        }
        Ok(offset)
    }

    /// Picks a redirection strategy for a single request.
    ///
    /// `ban_rel32` forces the kangaroo fallback path outright (not merely
    /// "skip rel32 and try abs64 next") — it exists purely so tests can
    /// exercise the kangaroo path deterministically even when a direct
    /// strategy would otherwise suffice.
    fn create_redirection(
        &self,
        original: usize,
        replacement: usize,
        preamble_size: usize,
        ban_rel32: bool,
    ) -> Redirection {
        if ban_rel32 {
            return Redirection::Kangaroo;
        }
        let jmp_size = self.redirect_size_bytes() as i64;
        let distance = replacement as i64 - (original as i64 + jmp_size);
        let rel32_fits = distance >= i32::MIN as i64 && distance <= i32::MAX as i64;
        if rel32_fits {
            return Redirection::Rel32;
        }
        if self.supports_direct_absolute() && preamble_size >= self.absolute_jump_size_bytes() {
            return Redirection::Abs64;
        }
        Redirection::Kangaroo
    }

    /// Sanity-checks that the chosen redirect can actually be encoded for
    /// this architecture, e.g. on IA-32 that the redirect fits in a signed
    /// 32-bit displacement. Called immediately before writing.
    fn validate_code_locations(
        &self,
        original: usize,
        target: usize,
        redirection: Redirection,
    ) -> Result<(), PatchError> {
        if matches!(redirection, Redirection::Rel32 | Redirection::Kangaroo) {
            let jmp_size = self.redirect_size_bytes() as i64;
            let distance = target as i64 - (original as i64 + jmp_size);
            if distance < i32::MIN as i64 || distance > i32::MAX as i64 {
                return Err(PatchError::RedirectOutOfRange {
                    original,
                    replacement: target,
                    distance,
                });
            }
        }
        Ok(())
    }

    /// Writes the chosen redirect into `original_bytes` (which must be at
    /// least `preamble_size` long), padding any residual displaced bytes
    /// with single-byte trap opcodes so stray execution fault-fast instead
    /// of streaming into half an instruction.
    ///
    /// For [`Redirection::Kangaroo`], `kangaroo_island_address` must be the
    /// jump island's address (`stub_address + preamble_size +
    /// redirect_size_bytes()`), not the stub's base — the stub's base holds
    /// the trampoline's preamble replay, not the replacement jump.
    fn write_redirect(
        &self,
        original_bytes: &mut [u8],
        original_address: usize,
        redirection: Redirection,
        replacement_address: usize,
        kangaroo_island_address: Option<usize>,
        preamble_size: usize,
    );

    /// Copies the captured preamble into `stub_bytes`, appends a jump back
    /// to `resume_address` (`original + preamble_size`), and — if
    /// `kangaroo_island` is set — writes the absolute jump to the
    /// replacement at the given offset within the same stub.
    fn write_trampoline(
        &self,
        stub_bytes: &mut [u8],
        stub_address: usize,
        preamble: &[u8],
        resume_address: usize,
        kangaroo_island: Option<(usize, usize)>,
    );
}

#[cfg(target_pointer_width = "64")]
pub type ActiveInstructionSet = X64;

#[cfg(target_pointer_width = "32")]
pub type ActiveInstructionSet = Ia32;

/// Trap opcode (`int3`) used to pad the tail of a redirect so any residual
/// displaced bytes fault immediately rather than running as a mangled
/// instruction.
pub(crate) const INT3: u8 = 0xCC;

pub(crate) fn pad_with_int3(bytes: &mut [u8], written: usize) {
    for b in bytes.iter_mut().skip(written) {
        *b = INT3;
    }
}
