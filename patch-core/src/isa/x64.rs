use super::{pad_with_int3, InstructionSet};
use crate::disasm::Disassembler;
use crate::redirect::Redirection;

/// x86-64: `E9 rel32` for the short redirect, `mov r11, imm64 ; jmp r11`
/// (13 bytes) for the absolute form, available both as a direct redirect and
/// as a kangaroo stub's jump island.
pub struct X64 {
    disassembler: Disassembler,
}

impl X64 {
    pub fn new() -> Self {
        Self {
            disassembler: Disassembler::new(64),
        }
    }
}

impl Default for X64 {
    fn default() -> Self {
        Self::new()
    }
}

fn write_rel32(bytes: &mut [u8], from: usize, to: usize) {
    bytes[0] = 0xE9;
    let disp = (to as i64 - (from as i64 + 5)) as i32;
    bytes[1..5].copy_from_slice(&disp.to_le_bytes());
}

fn write_abs64(bytes: &mut [u8], target: usize) {
    // mov r11, imm64
    bytes[0] = 0x49;
    bytes[1] = 0xBB;
    bytes[2..10].copy_from_slice(&(target as u64).to_le_bytes());
    // jmp r11
    bytes[10] = 0x41;
    bytes[11] = 0xFF;
    bytes[12] = 0xE3;
}

impl InstructionSet for X64 {
    fn bitness(&self) -> u32 {
        64
    }

    fn absolute_jump_size_bytes(&self) -> usize {
        13
    }

    fn supports_direct_absolute(&self) -> bool {
        true
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
                write_abs64(original_bytes, replacement_address);
                13
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
            write_abs64(&mut stub_bytes[island_offset..], replacement_address);
        }
    }
}
