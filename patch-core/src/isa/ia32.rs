use super::{pad_with_int3, InstructionSet};
use crate::disasm::Disassembler;
use crate::redirect::Redirection;

/// IA-32: `E9 rel32` for the short redirect, `mov eax, imm32 ; jmp eax`
/// (7 bytes) for the absolute form. There is no direct-absolute redirect on
/// this architecture — an out-of-range target always goes through kangaroo.
pub struct Ia32 {
    disassembler: Disassembler,
}

impl Ia32 {
    pub fn new() -> Self {
        Self {
            disassembler: Disassembler::new(32),
        }
    }
}

impl Default for Ia32 {
    fn default() -> Self {
        Self::new()
    }
}

fn write_rel32(bytes: &mut [u8], from: usize, to: usize) {
    bytes[0] = 0xE9;
    let disp = (to as i64 - (from as i64 + 5)) as i32;
    bytes[1..5].copy_from_slice(&disp.to_le_bytes());
}

fn write_abs32(bytes: &mut [u8], target: usize) {
    // mov eax, imm32
    bytes[0] = 0xB8;
    bytes[1..5].copy_from_slice(&(target as u32).to_le_bytes());
    // jmp eax
    bytes[5] = 0xFF;
    bytes[6] = 0xE0;
}

impl InstructionSet for Ia32 {
    fn bitness(&self) -> u32 {
        32
    }

    fn absolute_jump_size_bytes(&self) -> usize {
        7
    }

    fn supports_direct_absolute(&self) -> bool {
        false
    }

    fn disassembler(&self) -> &Disassembler {
        &self.disassembler
    }

    fn write_redirect(
        &self,
        original_bytes: &mut [u8],
        original_address: usize,
        redirection: Redirection,
        replacement_address: usize,
        kangaroo_island_address: Option<usize>,
        preamble_size: usize,
    ) {
        let written = match redirection {
            Redirection::Rel32 => {
                write_rel32(original_bytes, original_address, replacement_address);
                5
            }
            Redirection::Abs64 => {
                unreachable!("IA-32 never selects the direct-absolute redirection")
            }
            Redirection::Kangaroo => {
                let island = kangaroo_island_address.expect("kangaroo redirection requires an island address");
                write_rel32(original_bytes, original_address, island);
                5
            }
        };
        pad_with_int3(&mut original_bytes[..preamble_size], written);
    }

    fn write_trampoline(
        &self,
        stub_bytes: &mut [u8],
        stub_address: usize,
        preamble: &[u8],
        resume_address: usize,
        kangaroo_island: Option<(usize, usize)>,
    ) {
        stub_bytes[..preamble.len()].copy_from_slice(preamble);
        write_rel32(&mut stub_bytes[preamble.len()..], stub_address + preamble.len(), resume_address);
        if let Some((island_offset, replacement_address)) = kangaroo_island {
            write_abs32(&mut stub_bytes[island_offset..], replacement_address);
        }
    }
}
