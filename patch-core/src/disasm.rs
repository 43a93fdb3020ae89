//! Resolves one instruction at a time from a preamble byte stream, reports
//! its length, and classifies it as safe or unsafe to relocate.
//!
//! The trampoline's whole job is to re-execute the displaced preamble bytes
//! at a different address, so anything whose semantics depend on its own
//! address — relative jumps/calls, RIP-relative loads, returns — cannot be
//! relocated naively and must be rejected. Built on `iced-x86`.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};

/// Outcome of resolving a single instruction at a given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The instruction is complete, well-formed, and on the relocatable
    /// whitelist.
    Resolved,
    /// Well-formed but rejected by the whitelist; `opcode` is the first byte,
    /// kept for diagnostics.
    NotWhitelisted { opcode: u8 },
    /// The decoder could not make sense of the bytes at this offset.
    InvalidInstruction,
}

/// The result of [`Disassembler::resolve`]: how many bytes the instruction at
/// `offset` occupies, and whether it's safe to relocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub length: usize,
    pub status: ResolveStatus,
}

/// Decodes one instruction at a time out of a caller-supplied byte window.
///
/// `bitness` is 32 or 64, matching the target architecture; the instruction
/// set module picks the right one at compile time.
pub struct Disassembler {
    bitness: u32,
}

impl Disassembler {
    pub fn new(bitness: u32) -> Self {
        debug_assert!(bitness == 32 || bitness == 64);
        Self { bitness }
    }

    /// Resolves the instruction starting at `offset` within `code`. Never
    /// reads past `code.len()`: the decoder is only ever handed the
    /// remaining slice `code[offset..]`, so an instruction that would need
    /// bytes beyond the span simply decodes as invalid rather than reading
    /// out of bounds.
    pub fn resolve(&self, code: &[u8], offset: usize) -> Resolution {
        if offset >= code.len() {
            return Resolution {
                length: 0,
                status: ResolveStatus::InvalidInstruction,
            };
        }
        let window = &code[offset..];
        let mut decoder = Decoder::new(self.bitness, window, DecoderOptions::NONE);
        let instr = decoder.decode();

        if instr.is_invalid() || instr.len() == 0 {
            return Resolution {
                length: instr.len().max(1),
                status: ResolveStatus::InvalidInstruction,
            };
        }

        let length = instr.len();
        if is_relocatable(&instr) {
            Resolution {
                length,
                status: ResolveStatus::Resolved,
            }
        } else {
            Resolution {
                length,
                status: ResolveStatus::NotWhitelisted { opcode: window[0] },
            }
        }
    }
}

/// Matches `OpKind` variants that carry an immediate value, regardless of
/// its encoded width (8/16/32/64, including the sign-extended `imm8`
/// encodings used by e.g. `push imm8`).
fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

/// The minimum-viable whitelist: the instruction family typical of function
/// prologues on the supported Windows versions.
/// `nop`; register-register `add`; `push`/`pop` of a general register;
/// `push imm8/imm16/imm32`; `mov r,r`; `mov r,imm32`; `lea` (as long as it
/// doesn't address relative to its own instruction pointer).
fn is_relocatable(instr: &iced_x86::Instruction) -> bool {
    match instr.mnemonic() {
        Mnemonic::Nop => true,

        Mnemonic::Add => {
            instr.op_count() == 2
                && instr.op0_kind() == OpKind::Register
                && instr.op1_kind() == OpKind::Register
        }

        Mnemonic::Push => {
            instr.op_count() == 1
                && (instr.op0_kind() == OpKind::Register || is_immediate(instr.op0_kind()))
        }

        Mnemonic::Pop => instr.op_count() == 1 && instr.op0_kind() == OpKind::Register,

        Mnemonic::Mov => {
            instr.op_count() == 2
                && instr.op0_kind() == OpKind::Register
                && (instr.op1_kind() == OpKind::Register || is_immediate(instr.op1_kind()))
        }

        Mnemonic::Lea => {
            instr.op_count() == 2
                && instr.op0_kind() == OpKind::Register
                && instr.op1_kind() == OpKind::Memory
                && !instr.is_ip_rel_memory_operand()
        }

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_resolved() {
        let d = Disassembler::new(64);
        let r = d.resolve(&[0x90], 0);
        assert_eq!(r.length, 1);
        assert_eq!(r.status, ResolveStatus::Resolved);
    }

    #[test]
    fn push_reg_is_resolved() {
        // push rbx
        let d = Disassembler::new(64);
        let r = d.resolve(&[0x53], 0);
        assert_eq!(r.length, 1);
        assert_eq!(r.status, ResolveStatus::Resolved);
    }

    #[test]
    fn mov_reg_imm32_is_resolved() {
        // mov eax, 0x11223344
        let d = Disassembler::new(64);
        let bytes = [0xB8, 0x44, 0x33, 0x22, 0x11];
        let r = d.resolve(&bytes, 0);
        assert_eq!(r.length, 5);
        assert_eq!(r.status, ResolveStatus::Resolved);
    }

    #[test]
    fn call_rel32_is_not_whitelisted() {
        // call $+5 (relative)
        let d = Disassembler::new(64);
        let bytes = [0xE8, 0x00, 0x00, 0x00, 0x00];
        let r = d.resolve(&bytes, 0);
        assert_eq!(r.length, 5);
        assert_eq!(r.status, ResolveStatus::NotWhitelisted { opcode: 0xE8 });
    }

    #[test]
    fn ret_is_not_whitelisted() {
        let d = Disassembler::new(64);
        let r = d.resolve(&[0xC3], 0);
        assert_eq!(r.length, 1);
        assert_eq!(r.status, ResolveStatus::NotWhitelisted { opcode: 0xC3 });
    }

    #[test]
    fn rip_relative_lea_is_not_whitelisted() {
        // lea rax, [rip+0x10]
        let d = Disassembler::new(64);
        let bytes = [0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00];
        let r = d.resolve(&bytes, 0);
        assert_eq!(r.status, ResolveStatus::NotWhitelisted { opcode: 0x48 });
    }

    #[test]
    fn lengths_sum_exactly_over_a_whitelisted_sequence() {
        // push rbp ; mov rbp, rsp(as mov r,r) ; nop ; pop rbp
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x90, 0x5D];
        let d = Disassembler::new(64);
        let mut offset = 0;
        let mut total = 0;
        while offset < bytes.len() {
            let r = d.resolve(&bytes, offset);
            assert_eq!(r.status, ResolveStatus::Resolved);
            total += r.length;
            offset += r.length;
        }
        assert_eq!(total, bytes.len());
    }

    #[test]
    fn truncated_instruction_is_invalid() {
        // mov eax, imm32 opcode with only 2 of 5 bytes present
        let d = Disassembler::new(64);
        let r = d.resolve(&[0xB8, 0x01], 0);
        assert_eq!(r.status, ResolveStatus::InvalidInstruction);
    }
}
