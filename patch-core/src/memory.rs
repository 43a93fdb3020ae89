//! Page-granular permission flips, and allocation of executable memory near
//! an anchor address.
//!
//! The production implementation is Windows-only (`VirtualAlloc` /
//! `VirtualProtect` / `VirtualFree`). A POSIX-backed implementation is also
//! compiled, but only under `cfg(test)` — see [`PosixMemoryManager`] — so the
//! rest of the crate (disassembler, instruction set, patch set state machine)
//! can be exercised by `cargo test` on any host. It is never part of the
//! shipped `agent` cdylib.

use shared::errors::PatchError;

/// A contiguous region of memory, start address plus length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock {
    pub start: usize,
    pub len: usize,
}

impl CodeBlock {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.start as *mut u8
    }

    /// The signed byte distance from this block to `other`, worst case: the
    /// farthest pair of endpoints across the two ranges. Used to check
    /// whether a stub arena is reachable by a short jump from every function
    /// in a patch set.
    pub fn worst_case_distance(&self, other: &CodeBlock) -> i64 {
        let candidates = [
            other.start as i64 - self.start as i64,
            other.end() as i64 - self.start as i64,
            other.start as i64 - self.end() as i64,
            other.end() as i64 - self.end() as i64,
        ];
        candidates
            .into_iter()
            .max_by_key(|d| d.unsigned_abs())
            .unwrap()
    }
}

/// Opaque token describing the page permissions in effect before an
/// `open_for_writing` call, so they can be restored exactly by
/// `close_for_writing` — one `(page_address, protection_bits)` entry per
/// page touched, since adjacent pages are not guaranteed to share a
/// protection. The bit encoding is owned by whichever `MemoryManager`
/// implementation produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldPermissions(pub Vec<(usize, u32)>);

/// The memory-manager contract: page-permission flips, and an allocator for
/// executable memory reachable from a given anchor.
///
/// Every operation is fallible; callers (the patch set) must treat failure
/// as terminal for the whole set — there is no partial apply.
pub trait MemoryManager {
    /// Grants write permission across every page `region` touches. Returns a
    /// token describing the permissions that were in effect before the call,
    /// so they can be restored exactly.
    fn open_for_writing(&self, region: CodeBlock) -> Result<OldPermissions, PatchError>;

    /// Restores the permissions described by `old_perms` across every page
    /// `region` touches.
    fn close_for_writing(
        &self,
        region: CodeBlock,
        old_perms: OldPermissions,
    ) -> Result<(), PatchError>;

    /// Obtains a read/write/execute region of `size` bytes such that every
    /// byte of the returned block is within `max_distance` of `anchor`
    /// (signed). Returns `Err(NoMemoryInReach)` if no such placement exists.
    fn alloc_executable(
        &self,
        anchor: usize,
        size: usize,
        max_distance: i64,
    ) -> Result<CodeBlock, PatchError>;

    /// Releases a block previously returned by `alloc_executable`.
    fn free_block(&self, block: CodeBlock) -> Result<(), PatchError>;
}

/// Page size assumed by the proximity-scan allocator. 4 KiB on every
/// architecture this crate supports.
const PAGE_SIZE: usize = 0x1000;

/// Splits `region` into the page-aligned spans it touches. Implementations
/// must iterate per page rather than assume a single-page region; patches
/// straddling a page boundary are supported.
fn pages_touched(region: CodeBlock) -> impl Iterator<Item = usize> {
    let first_page = region.start & !(PAGE_SIZE - 1);
    let last_page = (region.end() - 1) & !(PAGE_SIZE - 1);
    (first_page..=last_page).step_by(PAGE_SIZE)
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    };

    /// The production memory manager: `VirtualAlloc`/`VirtualProtect`/
    /// `VirtualFree` against the current process's address space, generalized
    /// to multi-page regions and proximity-bounded allocation.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsMemoryManager;

    impl WindowsMemoryManager {
        pub fn new() -> Self {
            Self
        }
    }

    impl MemoryManager for WindowsMemoryManager {
        fn open_for_writing(&self, region: CodeBlock) -> Result<OldPermissions, PatchError> {
            // Each page gets its own VirtualProtect round-trip and its own
            // entry in the returned token: a region can straddle a boundary
            // between pages with different prior protections (e.g. a
            // redirect spanning a code/rodata page), and restoring one
            // page's value onto another would corrupt it.
            let mut saved = Vec::new();
            for page in pages_touched(region) {
                let mut old = PAGE_PROTECTION_FLAGS::default();
                let ok = unsafe {
                    VirtualProtect(
                        page as *mut _,
                        PAGE_SIZE,
                        PAGE_EXECUTE_READWRITE,
                        &mut old,
                    )
                };
                if ok.is_err() {
                    return Err(PatchError::PagePermissionDenied {
                        address: region.start,
                        length: region.len,
                    });
                }
                saved.push((page, old.0));
            }
            Ok(OldPermissions(saved))
        }

        fn close_for_writing(
            &self,
            region: CodeBlock,
            old_perms: OldPermissions,
        ) -> Result<(), PatchError> {
            for (page, flags) in &old_perms.0 {
                let mut discard = PAGE_PROTECTION_FLAGS::default();
                let ok = unsafe {
                    VirtualProtect(*page as *mut _, PAGE_SIZE, PAGE_PROTECTION_FLAGS(*flags), &mut discard)
                };
                if ok.is_err() {
                    return Err(PatchError::PagePermissionDenied {
                        address: region.start,
                        length: region.len,
                    });
                }
            }
            unsafe {
                let _ = FlushInstructionCache(
                    HANDLE(std::ptr::null_mut()),
                    Some(region.as_ptr() as *const _),
                    region.len,
                );
            }
            Ok(())
        }

        fn alloc_executable(
            &self,
            anchor: usize,
            size: usize,
            max_distance: i64,
        ) -> Result<CodeBlock, PatchError> {
            // Scan outward from the anchor in page-sized strides, the usual
            // technique for placing a stub arena within a short jump's
            // reach: ask VirtualAlloc for memory at a specific address hint
            // and accept whatever the first successful hint yields.
            let anchor_page = anchor & !(PAGE_SIZE - 1);
            let max_steps = (max_distance.unsigned_abs() as usize) / PAGE_SIZE;
            for step in 0..max_steps {
                for candidate in [
                    anchor_page.wrapping_add(step * PAGE_SIZE),
                    anchor_page.wrapping_sub(step * PAGE_SIZE),
                ] {
                    if candidate == 0 {
                        continue;
                    }
                    let ptr = unsafe {
                        VirtualAlloc(
                            Some(candidate as *const _),
                            size,
                            MEM_COMMIT | MEM_RESERVE,
                            PAGE_EXECUTE_READWRITE,
                        )
                    };
                    if !ptr.is_null() {
                        let block = CodeBlock::new(ptr as usize, size);
                        if block.worst_case_distance(&CodeBlock::new(anchor, 1)).unsigned_abs()
                            as i64
                            <= max_distance
                        {
                            return Ok(block);
                        }
                        // Hint was ignored and placed out of range; release
                        // and keep scanning.
                        unsafe {
                            let _ = VirtualFree(ptr, 0, MEM_RELEASE);
                        }
                    }
                }
            }
            // Last resort: let the OS place it anywhere and check after the
            // fact, since a hinted allocation can fail even when a
            // reachable, unhinted one would succeed.
            let ptr = unsafe {
                VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
            };
            if ptr.is_null() {
                return Err(PatchError::NoMemoryInReach { anchor, size });
            }
            let block = CodeBlock::new(ptr as usize, size);
            if block.worst_case_distance(&CodeBlock::new(anchor, 1)).unsigned_abs() as i64
                <= max_distance
            {
                Ok(block)
            } else {
                unsafe {
                    let _ = VirtualFree(ptr, 0, MEM_RELEASE);
                }
                Err(PatchError::NoMemoryInReach { anchor, size })
            }
        }

        fn free_block(&self, block: CodeBlock) -> Result<(), PatchError> {
            unsafe {
                VirtualFree(block.as_ptr() as *mut _, 0, MEM_RELEASE)
                    .map_err(|_| PatchError::PagePermissionDenied {
                        address: block.start,
                        length: block.len,
                    })
            }
        }
    }

    // Silence unused-import warnings on configurations that never exercise
    // the read-only fallback path.
    #[allow(unused_imports)]
    use PAGE_EXECUTE_READ as _PAGE_EXECUTE_READ_REEXPORT;
}

#[cfg(windows)]
pub use windows_impl::WindowsMemoryManager;

/// A `mmap`/`mprotect`-backed memory manager used only by this crate's own
/// test suite — never compiled into a shipped build.
#[cfg(any(test, feature = "test-mock"))]
#[cfg(unix)]
pub mod posix_mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct PosixMemoryManager {
        // libc's mmap doesn't give us an "old protection" readback, so the
        // mock tracks it itself, keyed by page address.
        tracked: Mutex<HashMap<usize, i32>>,
    }

    impl PosixMemoryManager {
        pub fn new() -> Self {
            Self {
                tracked: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Default for PosixMemoryManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryManager for PosixMemoryManager {
        fn open_for_writing(&self, region: CodeBlock) -> Result<OldPermissions, PatchError> {
            let mut tracked = self.tracked.lock().unwrap();
            let mut saved = Vec::new();
            for page in pages_touched(region) {
                let old = *tracked
                    .entry(page)
                    .or_insert(libc::PROT_READ | libc::PROT_EXEC);
                saved.push((page, old as u32));
                let rc = unsafe {
                    libc::mprotect(
                        page as *mut _,
                        PAGE_SIZE,
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    )
                };
                if rc != 0 {
                    return Err(PatchError::PagePermissionDenied {
                        address: region.start,
                        length: region.len,
                    });
                }
            }
            Ok(OldPermissions(saved))
        }

        fn close_for_writing(
            &self,
            region: CodeBlock,
            old_perms: OldPermissions,
        ) -> Result<(), PatchError> {
            let mut tracked = self.tracked.lock().unwrap();
            for (page, flags) in &old_perms.0 {
                tracked.insert(*page, *flags as i32);
                let rc = unsafe { libc::mprotect(*page as *mut _, PAGE_SIZE, *flags as i32) };
                if rc != 0 {
                    return Err(PatchError::PagePermissionDenied {
                        address: region.start,
                        length: region.len,
                    });
                }
            }
            Ok(())
        }

        fn alloc_executable(
            &self,
            anchor: usize,
            size: usize,
            max_distance: i64,
        ) -> Result<CodeBlock, PatchError> {
            let len = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(PatchError::NoMemoryInReach { anchor, size });
            }
            let block = CodeBlock::new(ptr as usize, size);
            // Unlike VirtualAlloc, mmap has no address-hint guarantee worth
            // relying on in a portable test mock, so the proximity check is
            // advisory: tests that need rel32 reach either run on a target
            // wide enough to not care, or use abs64/kangaroo explicitly.
            let _ = max_distance;
            Ok(block)
        }

        fn free_block(&self, block: CodeBlock) -> Result<(), PatchError> {
            let len = block.len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let rc = unsafe { libc::munmap(block.as_ptr() as *mut _, len) };
            if rc == 0 {
                Ok(())
            } else {
                Err(PatchError::PagePermissionDenied {
                    address: block.start,
                    length: block.len,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_touched_single_page() {
        let region = CodeBlock::new(0x1000, 16);
        let pages: Vec<_> = pages_touched(region).collect();
        assert_eq!(pages, vec![0x1000]);
    }

    #[test]
    fn pages_touched_straddles_boundary() {
        let region = CodeBlock::new(0x0FF8, 16);
        let pages: Vec<_> = pages_touched(region).collect();
        assert_eq!(pages, vec![0x0000, 0x1000]);
    }

    #[test]
    fn worst_case_distance_is_symmetric_in_magnitude() {
        let a = CodeBlock::new(100, 10);
        let b = CodeBlock::new(1000, 5);
        assert_eq!(a.worst_case_distance(&b), 1005 - 100);
    }
}
