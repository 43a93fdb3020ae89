//! Request and patch-set bookkeeping: turns a list of (original, replacement)
//! pairs into an applied or reverted state, coordinating the instruction set
//! and the memory manager.

use bitflags::bitflags;

use crate::isa::{ActiveInstructionSet, InstructionSet, MAX_PREAMBLE};
use crate::memory::{CodeBlock, MemoryManager};
use crate::redirect::Redirection;
use shared::errors::PatchError;

bitflags! {
    /// Flags controlling how a single [`PatchRequest`] is applied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PatchRequestFlags: u32 {
        /// Build a trampoline that still invokes the original behaviour.
        /// Without this the original is simply overwritten with no way back.
        const MAKE_TRAMPOLINE = 0x1;
        /// Forbid the rel32 strategy outright, forcing kangaroo even when a
        /// direct redirect would have worked. Exists for deterministic test
        /// coverage of the fallback path.
        const BAN_REL32 = 0x2;
    }
}

impl Default for PatchRequestFlags {
    fn default() -> Self {
        PatchRequestFlags::MAKE_TRAMPOLINE
    }
}

/// Lifecycle state of a [`PatchSet`], mirroring the states a binary patch can
/// be in from request to applied (and back again on revert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    NotApplied,
    Prepared,
    Open,
    AppliedOpen,
    Applied,
    RevertedOpen,
    Failed,
}

/// One function to redirect: where it lives, what it should redirect to, and
/// (once prepared) what was learned about how to do that safely.
pub struct PatchRequest {
    original: usize,
    replacement: usize,
    flags: PatchRequestFlags,
    preamble: [u8; MAX_PREAMBLE],
    preamble_size: usize,
    redirection: Option<Redirection>,
    stub_address: Option<usize>,
}

impl PatchRequest {
    pub fn new(original: usize, replacement: usize, flags: PatchRequestFlags) -> Self {
        Self {
            original,
            replacement,
            flags,
            preamble: [0u8; MAX_PREAMBLE],
            preamble_size: 0,
            redirection: None,
            stub_address: None,
        }
    }

    pub fn original(&self) -> usize {
        self.original
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }

    pub fn redirection(&self) -> Option<Redirection> {
        self.redirection
    }

    /// The trampoline entry point, valid once the owning [`PatchSet`] has
    /// reached [`PatchStatus::AppliedOpen`] or later.
    pub fn trampoline(&self) -> Option<usize> {
        if self.flags.contains(PatchRequestFlags::MAKE_TRAMPOLINE) {
            self.stub_address
        } else {
            None
        }
    }

    fn prepare(&mut self, isa: &ActiveInstructionSet) -> Result<(), PatchError> {
        let window = unsafe { std::slice::from_raw_parts(self.original as *const u8, MAX_PREAMBLE) };
        let preamble_size = isa.preamble_size(self.original, window)?;
        self.preamble[..preamble_size].copy_from_slice(&window[..preamble_size]);
        self.preamble_size = preamble_size;
        Ok(())
    }
}

/// Size of the fixed slab reserved per request: a trampoline (captured
/// preamble plus a resume jump) and, if the kangaroo strategy is chosen, an
/// absolute-jump island. Sized generously since this is per-request, not
/// per-byte-of-original-code.
const STUB_SIZE: usize = MAX_PREAMBLE + 5 + 13;

/// A set of patches applied and reverted as one unit: they share a single
/// code range for the open/close-for-writing bracket and a single nearby
/// arena of trampoline stubs.
pub struct PatchSet<M: MemoryManager> {
    requests: Vec<PatchRequest>,
    isa: ActiveInstructionSet,
    memory: M,
    status: PatchStatus,
    old_perms: Option<crate::memory::OldPermissions>,
    arena: Option<CodeBlock>,
}

impl<M: MemoryManager> PatchSet<M> {
    pub fn new(memory: M, requests: Vec<PatchRequest>) -> Self {
        Self {
            requests,
            isa: ActiveInstructionSet::default(),
            memory,
            status: PatchStatus::NotApplied,
            old_perms: None,
            arena: None,
        }
    }

    pub fn status(&self) -> PatchStatus {
        self.status
    }

    pub fn request(&self, index: usize) -> &PatchRequest {
        &self.requests[index]
    }

    /// Applies every request in this set: prepares, opens the original code
    /// for writing, installs the redirects, and closes the code back up.
    pub fn apply(&mut self) -> Result<(), PatchError> {
        self.prepare_apply()?;
        self.open_for_patching()?;
        self.install_redirects();
        self.close_after_patching(PatchStatus::Applied)
    }

    /// Reverts every request in this set back to its original bytes.
    pub fn revert(&mut self) -> Result<(), PatchError> {
        self.open_for_patching()?;
        self.revert_redirects();
        self.close_after_patching(PatchStatus::NotApplied)?;
        if let Some(arena) = self.arena.take() {
            self.memory.free_block(arena)?;
        }
        Ok(())
    }

    fn determine_address_range(&self) -> Option<CodeBlock> {
        let lowest = self.requests.iter().map(PatchRequest::original).min()?;
        let highest = self.requests.iter().map(PatchRequest::original).max()?;
        Some(CodeBlock::new(lowest, highest - lowest))
    }

    /// The combined range to open for writing: from the lowest request's
    /// original address to the highest one's, extended by one redirect size
    /// so the highest request's own write footprint is covered too.
    fn determine_patch_range(&self) -> Option<CodeBlock> {
        let addr_range = self.determine_address_range()?;
        let write_size = self.isa.redirect_size_bytes();
        Some(CodeBlock::new(addr_range.start, addr_range.len + write_size))
    }

    fn prepare_apply(&mut self) -> Result<(), PatchError> {
        log::debug!("preparing to apply patch set of {} request(s)", self.requests.len());
        if self.requests.is_empty() {
            self.status = PatchStatus::Prepared;
            return Ok(());
        }
        let range = self.determine_patch_range().expect("non-empty request list has a range");
        let arena_size = STUB_SIZE * self.requests.len();
        let max_distance = i32::MAX as i64;
        let arena = self
            .memory
            .alloc_executable(range.start, arena_size, max_distance)
            .inspect_err(|_| self.status = PatchStatus::Failed)?;
        log::debug!(
            "patch range {:#x}..{:#x}, stub arena at {:#x}",
            range.start,
            range.end(),
            arena.start
        );

        for (i, request) in self.requests.iter_mut().enumerate() {
            request.prepare(&self.isa)?;
            let stub_address = arena.start + i * STUB_SIZE;
            request.stub_address = Some(stub_address);

            let ban_rel32 = request.flags.contains(PatchRequestFlags::BAN_REL32);
            let redirection =
                self.isa
                    .create_redirection(request.original, request.replacement, request.preamble_size, ban_rel32);
            // The stub's base holds the trampoline (preamble replay + resume jump);
            // the jump island with the absolute redirect to the replacement sits
            // past it. The original's short jump must land on the island, not the
            // stub base, or it resumes the original instead of reaching the replacement.
            let kangaroo_island = stub_address + request.preamble_size + self.isa.redirect_size_bytes();
            let target = match redirection {
                Redirection::Kangaroo => kangaroo_island,
                _ => request.replacement,
            };
            self.isa.validate_code_locations(request.original, target, redirection)?;
            request.redirection = Some(redirection);
        }

        self.arena = Some(arena);
        self.status = PatchStatus::Prepared;
        Ok(())
    }

    fn open_for_patching(&mut self) -> Result<(), PatchError> {
        log::debug!("opening original code for writing");
        let Some(region) = self.determine_patch_range() else {
            self.status = PatchStatus::Open;
            return Ok(());
        };
        let old_perms = self.memory.open_for_writing(region).inspect_err(|_| {
            self.status = PatchStatus::Failed;
        })?;
        self.old_perms = Some(old_perms);
        self.validate_open_for_patching();
        self.status = PatchStatus::Open;
        Ok(())
    }

    /// Round-trips one byte of each request's redirect window through a
    /// volatile read/write. Has no observable effect but will fault if the
    /// page isn't actually writable, turning a silent corruption into a
    /// loud one.
    fn validate_open_for_patching(&self) {
        let redirect_size = self.isa.redirect_size_bytes();
        for request in &self.requests {
            let addr = request.original as *mut u8;
            for offset in 0..redirect_size {
                unsafe {
                    let ptr = addr.add(offset);
                    let value = ptr.read_volatile();
                    ptr.write_volatile(value);
                }
            }
        }
    }

    fn install_redirects(&mut self) {
        log::debug!("installing redirects");
        let redirect_size = self.isa.redirect_size_bytes();
        for request in &mut self.requests {
            let redirection = request.redirection.expect("prepared before install");
            let original_bytes =
                unsafe { std::slice::from_raw_parts_mut(request.original as *mut u8, request.preamble_size) };
            let island_offset = request.preamble_size + redirect_size;
            let kangaroo_island_address = request.stub_address.map(|stub| stub + island_offset);
            self.isa.write_redirect(
                original_bytes,
                request.original,
                redirection,
                request.replacement,
                kangaroo_island_address,
                request.preamble_size,
            );

            if request.flags.contains(PatchRequestFlags::MAKE_TRAMPOLINE) || redirection.needs_kangaroo_stub() {
                let stub_address = request.stub_address.expect("allocated during prepare_apply");
                let stub_bytes = unsafe { std::slice::from_raw_parts_mut(stub_address as *mut u8, STUB_SIZE) };
                let resume_address = request.original + request.preamble_size;
                let kangaroo_island = redirection.needs_kangaroo_stub().then_some((island_offset, request.replacement));
                self.isa.write_trampoline(
                    stub_bytes,
                    stub_address,
                    &request.preamble[..request.preamble_size],
                    resume_address,
                    kangaroo_island,
                );
            }
        }
        log::debug!("successfully installed redirects");
        self.status = PatchStatus::AppliedOpen;
    }

    fn revert_redirects(&mut self) {
        log::debug!("reverting redirects");
        for request in &self.requests {
            let original_bytes =
                unsafe { std::slice::from_raw_parts_mut(request.original as *mut u8, request.preamble_size) };
            original_bytes.copy_from_slice(&request.preamble[..request.preamble_size]);
        }
        log::debug!("successfully reverted redirects");
        self.status = PatchStatus::RevertedOpen;
    }

    fn close_after_patching(&mut self, success_status: PatchStatus) -> Result<(), PatchError> {
        log::debug!("closing original code for writing");
        let Some(region) = self.determine_patch_range() else {
            self.status = success_status;
            return Ok(());
        };
        let old_perms = self.old_perms.take().expect("open_for_patching ran first");
        self.memory.close_for_writing(region, old_perms).inspect_err(|_| {
            self.status = PatchStatus::Failed;
        })?;
        log::debug!("successfully closed original code");
        self.status = success_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::posix_mock::PosixMemoryManager;

    // A relocatable function body we can safely overwrite in a test mapping:
    // enough `nop`s to cover the widest redirect this architecture can pick
    // (the abs64 sequence on x86-64 is 13 bytes) followed by a `ret`.
    const NOP_SLED: [u8; 14] = [
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3,
    ];

    fn map_executable(bytes: &[u8]) -> (PosixMemoryManager, CodeBlock) {
        let mgr = PosixMemoryManager::default();
        let block = mgr.alloc_executable(bytes.as_ptr() as usize, 4096, i32::MAX as i64).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), block.start as *mut u8, bytes.len());
        }
        (mgr, block)
    }

    #[test]
    fn address_range_covers_every_request_plus_one_redirect_size() {
        let mgr = PosixMemoryManager::default();
        let requests = vec![
            PatchRequest::new(15, 0, PatchRequestFlags::empty()),
            PatchRequest::new(10, 0, PatchRequestFlags::empty()),
            PatchRequest::new(36, 0, PatchRequestFlags::empty()),
        ];
        let set = PatchSet::new(mgr, requests);
        let range = set.determine_patch_range().expect("non-empty request list has a range");
        assert_eq!(range.start, 10);
        assert_eq!(range.end(), 36 + set.isa.redirect_size_bytes());
    }

    #[test]
    fn apply_and_revert_round_trip_rel32() {
        let (mgr, original_block) = map_executable(&NOP_SLED);
        let (_replacement_mgr, replacement_block) = map_executable(&NOP_SLED);

        let request = PatchRequest::new(
            original_block.start,
            replacement_block.start,
            PatchRequestFlags::MAKE_TRAMPOLINE,
        );
        let mut set = PatchSet::new(mgr, vec![request]);
        set.apply().expect("apply should succeed");
        assert_eq!(set.status(), PatchStatus::Applied);

        let redirected = unsafe { std::slice::from_raw_parts(original_block.start as *const u8, 1) };
        assert_eq!(redirected[0], 0xE9);

        assert!(set.request(0).trampoline().is_some());

        set.revert().expect("revert should succeed");
        assert_eq!(set.status(), PatchStatus::NotApplied);
        let restored = unsafe { std::slice::from_raw_parts(original_block.start as *const u8, NOP_SLED.len()) };
        assert_eq!(restored, &NOP_SLED);
    }

    #[test]
    fn ban_rel32_forces_kangaroo_even_when_near() {
        // mov eax, 0x2a ; ret — distinguishable from whatever a stray jump
        // into the trampoline's preamble replay would produce.
        const REPLACEMENT_BODY: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

        let (mgr, original_block) = map_executable(&NOP_SLED);
        let (_replacement_mgr, replacement_block) = map_executable(&REPLACEMENT_BODY);

        let request = PatchRequest::new(original_block.start, replacement_block.start, PatchRequestFlags::BAN_REL32);
        let mut set = PatchSet::new(mgr, vec![request]);
        set.apply().expect("apply should succeed");
        assert_eq!(set.request(0).redirection(), Some(Redirection::Kangaroo));

        // Calling through the patched entry point must actually land in the
        // replacement, not resume the original's displaced preamble.
        let patched: extern "C" fn() -> u32 = unsafe { std::mem::transmute(original_block.start as *const ()) };
        assert_eq!(patched(), 0x2A);

        set.revert().expect("revert should succeed");
        let restored = unsafe { std::slice::from_raw_parts(original_block.start as *const u8, NOP_SLED.len()) };
        assert_eq!(restored, &NOP_SLED);
    }

    #[test]
    fn unwhitelisted_preamble_aborts_before_any_write() {
        // `ret` (0xC3) immediately is not on the relocation whitelist.
        let bytes = [0xC3, 0x90, 0x90, 0x90, 0x90, 0x90];
        let (mgr, original_block) = map_executable(&bytes);
        let (_replacement_mgr, replacement_block) = map_executable(&bytes);

        let request = PatchRequest::new(original_block.start, replacement_block.start, PatchRequestFlags::empty());
        let mut set = PatchSet::new(mgr, vec![request]);
        let err = set.apply().unwrap_err();
        assert!(matches!(err, PatchError::UnrelocatablePreamble { offset: 0, .. }));

        let untouched = unsafe { std::slice::from_raw_parts(original_block.start as *const u8, bytes.len()) };
        assert_eq!(untouched, &bytes);
    }
}
