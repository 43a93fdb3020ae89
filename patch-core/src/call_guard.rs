//! Re-entrancy guard for code that runs inside a patched function or an LPC
//! interceptor, where calling back into the very API being intercepted would
//! recurse forever.
//!
//! Generalizes a single-slot version of this guard into one TLS slot per
//! named interception point, since a process can have both binary patches
//! and the LPC interceptor active at once and a call into one must not be
//! mistaken for re-entry into the other.
//!
//! Safety notes:
//! - Never dereferences the pointer stored in TLS, only compares it to NULL.
//! - No heap allocation while the guard is held.
//! - Built on raw Win32 TLS calls so it is safe to use from `DllMain` or
//!   while the loader lock is held.

#![allow(unsafe_code)]

use core::ffi::c_void;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use windows::Win32::System::Threading::{TlsAlloc, TlsGetValue, TlsSetValue};

/// Dummy non-NULL pointer used as the "inside guard" flag; never dereferenced.
const SENTINEL: *const c_void = 1_usize as *const c_void;

/// Lazily-allocated TLS slots, one per distinct guard name.
static SLOTS: Lazy<Mutex<HashMap<&'static str, u32>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn slot_for(name: &'static str) -> u32 {
    let mut slots = SLOTS.lock().unwrap_or_else(|e| e.into_inner());
    *slots.entry(name).or_insert_with(|| unsafe { TlsAlloc() })
}

/// Per-thread, per-named-guard re-entrancy state.
///
/// Each distinct `name` gets its own TLS slot the first time it's used, so
/// the patching guard and the LPC interceptor guard never interfere with
/// each other even when entered on the same thread in the same call chain.
pub struct InterceptGuardState {
    slot: u32,
}

impl InterceptGuardState {
    pub fn named(name: &'static str) -> Self {
        Self {
            slot: slot_for(name),
        }
    }

    /// Tries to enter the guarded section on the current thread. Returns
    /// `None` if this thread is already inside it.
    pub fn enter(&self) -> Option<Disable<'_>> {
        unsafe {
            if !TlsGetValue(self.slot).is_null() {
                return None;
            }
            if TlsSetValue(self.slot, Some(SENTINEL)).is_ok() {
                Some(Disable {
                    slot: self.slot,
                    _not_send: PhantomData,
                })
            } else {
                None
            }
        }
    }
}

/// RAII token proving the current thread holds a guard. Dropping it clears
/// the TLS flag so the thread may re-enter later.
pub struct Disable<'a> {
    slot: u32,
    _not_send: PhantomData<&'a ()>,
}

impl Drop for Disable<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = TlsSetValue(self.slot, None);
        }
    }
}
