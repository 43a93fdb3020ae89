//! Locating `ConsoleClientCallServer` (CCCS) and measuring the console
//! server's address-space delta, without ever parsing symbols.
//!
//! Two independent strategies try to find CCCS (Phase 1); a harness or the
//! real calibration sequence in [`super`] supplies the stack trace and the
//! caller's body, and [`consensus`] reconciles the two results.

use crate::disasm::{Disassembler, ResolveStatus};
use shared::errors::LpcError;

/// One entry in the expected call chain used by [`infer_address_guided`].
/// `start: None` marks the slot whose address is unknown and being
/// recovered — this is where CCCS belongs in the chain.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedFrame {
    pub start: Option<usize>,
    pub len: usize,
}

impl ExpectedFrame {
    pub fn known(start: usize, len: usize) -> Self {
        Self { start: Some(start), len }
    }

    pub fn placeholder(len: usize) -> Self {
        Self { start: None, len }
    }
}

/// True if `pc` falls within `[start, start+len]`, following at most one
/// level of `E9`-jump-thunk indirection (the incremental-linking case).
fn is_pc_within_function(pc: usize, start: usize, len: usize) -> bool {
    if pc >= start && pc <= start + len {
        return true;
    }
    let first_byte = unsafe { std::ptr::read(start as *const u8) };
    if first_byte != 0xE9 {
        return false;
    }
    let disp = unsafe { std::ptr::read_unaligned((start + 1) as *const i32) };
    let new_start = (start as i64 + 5 + disp as i64) as usize;
    pc >= new_start && pc <= new_start + len
}

/// Reads the rel32 `call` (`E8`) that produced `return_pc`, and returns its
/// target, if the preceding 5 bytes do in fact look like one.
fn extract_destination_from_return_pc(return_pc: usize) -> Option<usize> {
    let call_pc = return_pc.checked_sub(5)?;
    let opcode = unsafe { std::ptr::read(call_pc as *const u8) };
    if opcode != 0xE8 {
        return None;
    }
    let disp = unsafe { std::ptr::read_unaligned((call_pc + 1) as *const i32) };
    Some((call_pc as i64 + 5 + disp as i64) as usize)
}

/// Guided inference: walk the captured stack trace against the expected
/// call chain, requiring exactly one placeholder frame that is neither the
/// topmost nor the bottommost entry, then recover its address from the
/// call instruction in the frame immediately below it on the stack.
pub fn infer_address_guided(expected: &[ExpectedFrame], stack_trace: &[usize]) -> Option<usize> {
    let depth = expected.len();
    if stack_trace.len() < depth {
        return None;
    }
    let first = expected[0];
    let (first_start, first_len) = (first.start?, first.len);
    let anchor = stack_trace
        .iter()
        .position(|&pc| is_pc_within_function(pc, first_start, first_len))?;
    let trace = &stack_trace[anchor..];
    if trace.len() < depth {
        return None;
    }

    let mut placeholder_index = None;
    for (i, frame) in expected.iter().enumerate() {
        let pc = trace[i];
        if pc == 0 {
            return None;
        }
        match frame.start {
            None => placeholder_index = Some(i),
            Some(start) => {
                if !is_pc_within_function(pc, start, frame.len) {
                    return None;
                }
            }
        }
    }
    let placeholder_index = placeholder_index?;
    if placeholder_index == 0 || placeholder_index == depth - 1 {
        return None;
    }

    let caller_pc = trace[placeholder_index + 1];
    let result = extract_destination_from_return_pc(caller_pc)?;
    let result_pc = trace[placeholder_index];
    if !is_pc_within_function(result_pc, result, expected[placeholder_index].len) {
        return None;
    }
    Some(result)
}

/// Body-scan inference: decode `body` instruction by instruction looking
/// for a rel32 `call`. On 64-bit the target must be unique across the whole
/// body; on 32-bit the first one found is accepted.
pub fn infer_address_from_caller(disasm: &Disassembler, body: &[u8], body_address: usize, require_unique: bool) -> Option<usize> {
    let mut offset = 0usize;
    let mut targets: Vec<usize> = Vec::new();
    while offset < body.len() {
        let resolution = disasm.resolve(body, offset);
        let length = resolution.length.max(1);
        if resolution.status == (ResolveStatus::NotWhitelisted { opcode: 0xE8 }) && length == 5 && offset + 5 <= body.len() {
            let disp = i32::from_le_bytes(body[offset + 1..offset + 5].try_into().unwrap());
            let target = (body_address as i64 + offset as i64 + 5 + disp as i64) as usize;
            if !require_unique {
                return Some(target);
            }
            targets.push(target);
        }
        offset += length;
    }
    if !require_unique {
        return None;
    }
    targets.sort_unstable();
    targets.dedup();
    match targets.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// Reconciles the guided and body-scan results per the consensus rules: if
/// both succeed they must agree, if exactly one succeeds use it, if both
/// fail calibration fails outright.
pub fn consensus(guided: Option<usize>, body_scan: Option<usize>) -> Result<usize, LpcError> {
    match (guided, body_scan) {
        (Some(g), Some(b)) if g == b => Ok(g),
        (Some(guided), Some(body_scan)) => Err(LpcError::CalibrationMismatch { guided, body_scan }),
        (Some(g), None) => Ok(g),
        (None, Some(b)) => Ok(b),
        (None, None) => Err(LpcError::CalibrationFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny call site: `call rel32` targeting `target`, placed at `site`.
    fn write_call(buf: &mut [u8], site_offset: usize, site_addr: usize, target: usize) {
        buf[site_offset] = 0xE8;
        let disp = (target as i64 - (site_addr as i64 + site_offset as i64 + 5)) as i32;
        buf[site_offset + 1..site_offset + 5].copy_from_slice(&disp.to_le_bytes());
    }

    #[test]
    fn body_scan_finds_unique_call_on_64_bit() {
        let mut body = [0x90u8; 32];
        let body_addr = 0x1000usize;
        let target = 0x9000usize;
        write_call(&mut body, 10, body_addr, target);
        let disasm = Disassembler::new(64);
        let found = infer_address_from_caller(&disasm, &body, body_addr, true);
        assert_eq!(found, Some(target));
    }

    #[test]
    fn body_scan_rejects_ambiguous_calls_on_64_bit() {
        let mut body = [0x90u8; 32];
        let body_addr = 0x1000usize;
        write_call(&mut body, 5, body_addr, 0x9000);
        write_call(&mut body, 15, body_addr, 0xA000);
        let disasm = Disassembler::new(64);
        assert_eq!(infer_address_from_caller(&disasm, &body, body_addr, true), None);
    }

    #[test]
    fn body_scan_takes_first_call_on_32_bit() {
        let mut body = [0x90u8; 32];
        let body_addr = 0x1000usize;
        write_call(&mut body, 5, body_addr, 0x9000);
        write_call(&mut body, 15, body_addr, 0xA000);
        let disasm = Disassembler::new(32);
        assert_eq!(infer_address_from_caller(&disasm, &body, body_addr, false), Some(0x9000));
    }

    #[test]
    fn consensus_requires_agreement() {
        assert_eq!(consensus(Some(1), Some(1)), Ok(1));
        assert_eq!(consensus(Some(1), None), Ok(1));
        assert_eq!(consensus(None, Some(2)), Ok(2));
        assert!(consensus(None, None).is_err());
        assert!(matches!(
            consensus(Some(1), Some(2)),
            Err(LpcError::CalibrationMismatch { guided: 1, body_scan: 2 })
        ));
    }
}
