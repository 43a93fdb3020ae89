//! End-to-end coverage for the acceptance scenarios this crate is built
//! against: a short function redirected with `rel32`, a far replacement that
//! needs `abs64` (and IA-32's lack of one), `ban_rel32` forcing `kangaroo`
//! and actually landing in the replacement, an unwhitelisted preamble
//! aborting before any byte is written, and LPC calibration consensus.
//!
//! Run with `--features test-mock` so the POSIX memory manager is compiled
//! in. Address-range inference across multiple requests is covered by a
//! unit test in `src/patch.rs` instead of here, since it exercises a
//! private computation with no public accessor.

use patch_core::isa::{Ia32, InstructionSet};
use patch_core::lpc::{consensus, infer_address_from_caller, infer_address_guided, ExpectedFrame};
use patch_core::memory::posix_mock::PosixMemoryManager;
use patch_core::memory::CodeBlock;
use patch_core::{Disassembler, MemoryManager, PatchError, PatchRequest, PatchRequestFlags, PatchSet, Redirection};

// `mov eax, edi ; add eax, esi` computes `a + b` into the return register,
// padded with `nop`s so the preamble covers the widest redirect this
// architecture might pick (abs64 is 13 bytes on x86-64) before the `ret`.
const ADD_FN: [u8; 14] = [
    0x89, 0xF8, // mov eax, edi
    0x01, 0xF0, // add eax, esi
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // nop x9
    0xC3, // ret
];

// `mov eax, edi ; add eax, esi ; add eax, 1 ; ret` — `a + b + 1`.
const ADD_PLUS_ONE_FN: [u8; 8] = [0x89, 0xF8, 0x01, 0xF0, 0x83, 0xC0, 0x01, 0xC3];

// Thirteen whitelisted `nop`s followed by `ret` — a body with no arithmetic
// meaning, used by the scenarios that only care about the redirect strategy.
const NOP_SLED: [u8; 14] = [
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3,
];

fn map_executable(bytes: &[u8]) -> (PosixMemoryManager, CodeBlock) {
    let mgr = PosixMemoryManager::new();
    let block = mgr.alloc_executable(bytes.as_ptr() as usize, 4096, i32::MAX as i64).unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.start as *mut u8, bytes.len());
    }
    (mgr, block)
}

#[test]
fn short_function_uses_rel32_redirect() {
    let (mgr, original) = map_executable(&ADD_FN);
    let (_replacement_mgr, replacement) = map_executable(&ADD_PLUS_ONE_FN);

    let add: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(original.start) };
    assert_eq!(add(3, 5), 8);

    let request = PatchRequest::new(original.start, replacement.start, PatchRequestFlags::MAKE_TRAMPOLINE);
    let mut set = PatchSet::new(mgr, vec![request]);
    set.apply().expect("apply should succeed");
    assert_eq!(set.request(0).redirection(), Some(Redirection::Rel32));

    assert_eq!(add(3, 5), 9);

    set.revert().expect("revert should succeed");
    assert_eq!(add(3, 5), 8);
}

#[test]
fn far_replacement_uses_abs64_on_x64_without_ever_executing_it() {
    let (mgr, original) = map_executable(&NOP_SLED);
    // More than 2 GiB away: out of rel32's signed-displacement reach, but
    // never actually jumped to, so it doesn't need to be valid memory.
    let far_replacement = original.start.wrapping_add(0x1_0000_0000);

    let request = PatchRequest::new(original.start, far_replacement, PatchRequestFlags::MAKE_TRAMPOLINE);
    let mut set = PatchSet::new(mgr, vec![request]);
    set.apply().expect("apply should succeed");
    assert_eq!(set.request(0).redirection(), Some(Redirection::Abs64));

    let written = unsafe { std::slice::from_raw_parts(original.start as *const u8, 10) };
    assert_eq!(&written[0..2], &[0x49, 0xBB], "mov r11, imm64");
    assert_eq!(&written[2..10], &(far_replacement as u64).to_le_bytes());

    set.revert().expect("revert should succeed");
    let restored = unsafe { std::slice::from_raw_parts(original.start as *const u8, NOP_SLED.len()) };
    assert_eq!(restored, &NOP_SLED);
}

#[test]
fn far_replacement_on_ia32_falls_back_to_kangaroo_and_fails_if_even_the_stub_is_out_of_reach() {
    // IA-32 has no direct-absolute redirect, so a far replacement always
    // routes through kangaroo regardless of preamble length — exercised
    // directly against `Ia32` since `PatchSet` only drives the host's
    // `ActiveInstructionSet`.
    let ia32 = Ia32::new();
    let original = 0x1000usize;
    let far_replacement = 0x1_0000_0000usize;

    let redirection = ia32.create_redirection(original, far_replacement, 13, false);
    assert_eq!(redirection, Redirection::Kangaroo);

    // Kangaroo still needs the stub itself within rel32 reach of `original`.
    // A stub the allocator could only place as far out as the replacement
    // itself is the realistic failure mode on a 32-bit process with no
    // absolute fallback: validation must reject it before any byte is written.
    let err = ia32.validate_code_locations(original, far_replacement, redirection).unwrap_err();
    assert!(matches!(err, PatchError::RedirectOutOfRange { .. }));
}

#[test]
fn ban_rel32_forces_kangaroo_and_still_reaches_the_replacement() {
    // mov eax, 0x2a ; ret
    const MARKER_FN: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

    let (mgr, original) = map_executable(&NOP_SLED);
    let (_replacement_mgr, replacement) = map_executable(&MARKER_FN);

    let request = PatchRequest::new(original.start, replacement.start, PatchRequestFlags::BAN_REL32);
    let mut set = PatchSet::new(mgr, vec![request]);
    set.apply().expect("apply should succeed");
    assert_eq!(set.request(0).redirection(), Some(Redirection::Kangaroo));

    let patched: extern "C" fn() -> u32 = unsafe { std::mem::transmute(original.start) };
    assert_eq!(patched(), 0x2A, "trampoline behaviour must be preserved under kangaroo");

    set.revert().expect("revert should succeed");
}

#[test]
fn unwhitelisted_preamble_aborts_before_any_write() {
    // `call rel32` as the first instruction is not on the relocation whitelist.
    let bytes = [0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3];
    let (mgr, original) = map_executable(&bytes);
    let (_replacement_mgr, replacement) = map_executable(&bytes);

    let request = PatchRequest::new(original.start, replacement.start, PatchRequestFlags::empty());
    let mut set = PatchSet::new(mgr, vec![request]);
    let err = set.apply().unwrap_err();
    assert!(matches!(err, PatchError::UnrelocatablePreamble { offset: 0, .. }));

    let untouched = unsafe { std::slice::from_raw_parts(original.start as *const u8, bytes.len()) };
    assert_eq!(untouched, &bytes);
}

fn write_rel32_call(buf: &mut [u8], site_offset: usize, site_addr: usize, target: usize) {
    buf[site_offset] = 0xE8;
    let disp = (target as i64 - (site_addr as i64 + site_offset as i64 + 5)) as i32;
    buf[site_offset + 1..site_offset + 5].copy_from_slice(&disp.to_le_bytes());
}

#[test]
fn calibration_consensus_agrees_when_the_harness_is_consistent() {
    // `get_console_cp`'s body must be real memory: the guided path's
    // call-site extraction dereferences it directly, rather than reading
    // from a caller-supplied buffer the way the body-scan path does.
    let mut body = [0x90u8; 32];
    let body_addr = body.as_mut_ptr() as usize;
    let cccs = 0x9000usize; // "known address" the harness stubs CCCS at
    write_rel32_call(&mut body, 10, body_addr, cccs);

    let bridge_addr = 0x1000usize;
    let provoke_addr = 0x3000usize;
    let stack_trace = [bridge_addr + 4, cccs + 2, body_addr + 15, provoke_addr + 3];
    let expected = [
        ExpectedFrame::known(bridge_addr, 256),
        ExpectedFrame::placeholder(256),
        ExpectedFrame::known(body_addr, 256),
        ExpectedFrame::known(provoke_addr, 256),
    ];

    let guided = infer_address_guided(&expected, &stack_trace);
    assert_eq!(guided, Some(cccs));

    let disasm = Disassembler::new(64);
    let body_scan = infer_address_from_caller(&disasm, &body, body_addr, true);
    assert_eq!(body_scan, Some(cccs));

    assert_eq!(consensus(guided, body_scan), Ok(cccs));
}

#[test]
fn calibration_consensus_fails_when_body_scan_disagrees_with_the_guided_path() {
    let mut body = [0x90u8; 32];
    let real_body_addr = body.as_mut_ptr() as usize;
    let cccs = 0x9000usize;
    write_rel32_call(&mut body, 10, real_body_addr, cccs);

    let bridge_addr = 0x1000usize;
    let provoke_addr = 0x3000usize;
    let stack_trace = [bridge_addr + 4, cccs + 2, real_body_addr + 15, provoke_addr + 3];
    let expected = [
        ExpectedFrame::known(bridge_addr, 256),
        ExpectedFrame::placeholder(256),
        ExpectedFrame::known(real_body_addr, 256),
        ExpectedFrame::known(provoke_addr, 256),
    ];
    let guided = infer_address_guided(&expected, &stack_trace).expect("guided path should recover cccs");

    // Perturb the harness: body-scan is handed the same bytes but told they
    // live at a different base address, as if it resolved the wrong module
    // base. The recovered call target shifts accordingly.
    let disasm = Disassembler::new(64);
    let perturbed_body_addr = real_body_addr.wrapping_add(0x1000);
    let body_scan = infer_address_from_caller(&disasm, &body, perturbed_body_addr, true)
        .expect("body-scan should still find the sole call, just at the wrong address");
    assert_ne!(body_scan, guided);

    let err = consensus(Some(guided), Some(body_scan)).unwrap_err();
    assert!(matches!(
        err,
        patch_core::LpcError::CalibrationMismatch { guided: g, body_scan: b } if g == guided && b == body_scan
    ));
}
