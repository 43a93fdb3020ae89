//! Installs and calibrates the interceptor for `NtRequestWaitReplyPort`,
//! the single patch point this crate's LPC machinery owns.
//!
//! Calibration (see [`calibration`]) has no way to ask `kernel32` where
//! `ConsoleClientCallServer` lives or what address-space delta the console
//! server uses, so it recovers both by provoking calls that are known to
//! pass through those unknowns and watching what arrives at the patched
//! entry point.

mod calibration;
pub mod message;

pub use calibration::{consensus, infer_address_from_caller, infer_address_guided, ExpectedFrame};
pub use message::{AddressXform, CaptureBuffer, CaptureBufferData, Destination, Message, MessageData};

use crate::call_guard::InterceptGuardState;
use crate::disasm::Disassembler;
use crate::isa::{ActiveInstructionSet, InstructionSet};
use crate::memory::WindowsMemoryManager;
use crate::patch::{PatchRequest, PatchRequestFlags, PatchSet};
use shared::errors::{LpcError, PatchError};

use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Console::GetConsoleCP;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows::Win32::System::Shutdown::GetProcessShutdownParameters;
use windows::core::{s, PCSTR};

/// Default for how long a calibration phase waits for its provoking call to
/// reach the patched entry point before giving up, used when the caller
/// doesn't override it via [`install_lpc_interceptor`]. Calibration assumes
/// the provoking call arrives synchronously on this same thread; this bounds
/// how long it waits in case it never does. See `DESIGN.md`.
const DEFAULT_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Sentinel api-number used for the synthetic Phase 3 message; chosen to be
/// unmistakably outside the range of any real console API operation.
const CALIBRATION_API_NUMBER: u32 = 0x000D_ECAD;

type TrampolineFn = unsafe extern "system" fn(HANDLE, *mut MessageData, *mut MessageData) -> i32;
type CccsFn = unsafe extern "system" fn(*mut MessageData, *mut CaptureBufferData, u32, u32) -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalibrationMode {
    Idle,
    LocatingCccs,
    DeterminingBasePort,
    Calibrating,
}

#[derive(Default)]
struct CalibrationScratch {
    locate_port_handle: Option<isize>,
    stack_trace: Vec<usize>,
    locate_done: bool,
    base_port_handle: Option<isize>,
    base_port_done: bool,
    calibration_remote_capture_buffer: Option<usize>,
    calibration_done: bool,
}

struct Interceptor {
    patches: PatchSet<WindowsMemoryManager>,
    trampoline: TrampolineFn,
    handler: Box<dyn LpcHandler>,
    enabled: bool,
    console_port_handle: isize,
    base_port_handle: isize,
    xform: AddressXform,
    mode: CalibrationMode,
    calibration: CalibrationScratch,
    calibration_timeout: Duration,
}

static GLOBAL: Lazy<Mutex<Option<Interceptor>>> = Lazy::new(|| Mutex::new(None));
static GUARD: Lazy<InterceptGuardState> = Lazy::new(|| InterceptGuardState::named("lpc-interceptor"));

/// Handles one intercepted LPC call.
///
/// Returning `None` falls through to the original `NtRequestWaitReplyPort`
/// via the trampoline; returning `Some(status)` supplies that NTSTATUS
/// directly without calling through.
pub trait LpcHandler: Send + Sync {
    fn handle(&self, destination: Destination, message: &mut Message) -> Option<i32>;
}

/// A scoped guard that suspends interception on the current thread for its
/// lifetime, restoring the previous state on drop. Reentrant LPC calls made
/// from within a handler should hold one of these for their duration.
pub struct Disable<'a>(crate::call_guard::Disable<'a>);

pub fn disable_guard() -> Option<Disable<'static>> {
    GUARD.enter().map(Disable)
}

const STATUS_SUCCESS: i32 = 0;

unsafe fn call_trampoline(trampoline: TrampolineFn, port: HANDLE, request: *mut MessageData, reply: *mut MessageData) -> i32 {
    unsafe { trampoline(port, request, reply) }
}

unsafe extern "system" fn nt_request_wait_reply_port_bridge(
    port_handle: HANDLE,
    request: *mut MessageData,
    incoming_reply: *mut MessageData,
) -> i32 {
    let mut slot = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
    let inter = match slot.as_mut() {
        Some(inter) => inter,
        None => return STATUS_SUCCESS,
    };

    match inter.mode {
        CalibrationMode::LocatingCccs => {
            inter.calibration.locate_port_handle = Some(port_handle.0 as isize);
            inter.calibration.stack_trace = capture_stack_trace();
            inter.calibration.locate_done = true;
            return STATUS_SUCCESS;
        }
        CalibrationMode::DeterminingBasePort => {
            inter.calibration.base_port_handle = Some(port_handle.0 as isize);
            inter.calibration.base_port_done = true;
            return STATUS_SUCCESS;
        }
        CalibrationMode::Calibrating => {
            let api_number = unsafe { (*request).api_number };
            if api_number == CALIBRATION_API_NUMBER {
                let remote = unsafe { (*request).capture_buffer };
                inter.calibration.calibration_remote_capture_buffer = Some(remote as usize);
                inter.calibration.calibration_done = true;
                return STATUS_SUCCESS;
            }
        }
        CalibrationMode::Idle => {}
    }

    if !inter.enabled {
        return unsafe { call_trampoline(inter.trampoline, port_handle, request, incoming_reply) };
    }

    let destination = if port_handle.0 as isize == inter.console_port_handle {
        Destination::Console
    } else if port_handle.0 as isize == inter.base_port_handle {
        Destination::Base
    } else {
        Destination::Other
    };

    let Some(_token) = GUARD.enter() else {
        return unsafe { call_trampoline(inter.trampoline, port_handle, request, incoming_reply) };
    };

    let mut message = Message::new(unsafe { &mut *request }, inter.xform);
    match inter.handler.handle(destination, &mut message) {
        Some(status) => status,
        None => unsafe { call_trampoline(inter.trampoline, port_handle, request, incoming_reply) },
    }
}

/// Captures the current thread's return addresses, topmost frame first.
fn capture_stack_trace() -> Vec<usize> {
    let mut frames = Vec::with_capacity(16);
    unsafe {
        backtrace::trace(|frame| {
            frames.push(frame.ip() as usize);
            frames.len() < 16
        });
    }
    frames
}

fn module_function_address(module: PCSTR, name: PCSTR) -> Option<usize> {
    unsafe {
        let handle = GetModuleHandleA(module).ok()?;
        let addr = GetProcAddress(handle, name)?;
        Some(addr as usize)
    }
}

#[inline(never)]
fn provoke_locate_cccs() {
    unsafe {
        GetConsoleCP();
    }
}

#[inline(never)]
fn provoke_determine_base_port() {
    let mut dummy0 = 0u32;
    let mut dummy1 = 0u32;
    unsafe {
        let _ = GetProcessShutdownParameters(&mut dummy0, &mut dummy1);
    }
}

fn run_phase1_locate_cccs() -> Result<(usize, isize), LpcError> {
    let timeout = {
        let mut slot = GLOBAL.lock().unwrap();
        let inter = slot.as_mut().expect("interceptor installed before calibration");
        inter.mode = CalibrationMode::LocatingCccs;
        inter.calibration_timeout
    };

    let started = Instant::now();
    provoke_locate_cccs();
    loop {
        let slot = GLOBAL.lock().unwrap();
        let inter = slot.as_ref().expect("interceptor installed before calibration");
        if inter.calibration.locate_done {
            break;
        }
        if started.elapsed() > timeout {
            return Err(LpcError::CalibrationTimeout { phase: "locate_cccs" });
        }
        drop(slot);
        std::thread::yield_now();
    }

    let (stack_trace, port_handle) = {
        let mut slot = GLOBAL.lock().unwrap();
        let inter = slot.as_mut().expect("interceptor installed before calibration");
        inter.mode = CalibrationMode::Idle;
        (
            std::mem::take(&mut inter.calibration.stack_trace),
            inter.calibration.locate_port_handle.expect("locate_done implies a port handle"),
        )
    };

    let get_console_cp = GetConsoleCP as usize;
    let expected = [
        ExpectedFrame::known(nt_request_wait_reply_port_bridge as usize, 256),
        ExpectedFrame::placeholder(256),
        ExpectedFrame::known(get_console_cp, 256),
        ExpectedFrame::known(provoke_locate_cccs as usize, 256),
    ];
    let guided = infer_address_guided(&expected, &stack_trace);

    let bitness = ActiveInstructionSet::default().bitness();
    let disasm = Disassembler::new(bitness);
    let body = unsafe { std::slice::from_raw_parts(get_console_cp as *const u8, 256) };
    let require_unique = bitness == 64;
    let caller = infer_address_from_caller(&disasm, body, get_console_cp, require_unique);

    let cccs = consensus(guided, caller)?;
    Ok((cccs, port_handle))
}

fn run_phase2_determine_base_port() -> Result<isize, LpcError> {
    let timeout = {
        let mut slot = GLOBAL.lock().unwrap();
        let inter = slot.as_mut().unwrap();
        inter.mode = CalibrationMode::DeterminingBasePort;
        inter.calibration_timeout
    };

    let started = Instant::now();
    provoke_determine_base_port();
    loop {
        let slot = GLOBAL.lock().unwrap();
        let inter = slot.as_ref().unwrap();
        if inter.calibration.base_port_done {
            break;
        }
        if started.elapsed() > timeout {
            return Err(LpcError::CalibrationTimeout { phase: "determine_base_port" });
        }
        drop(slot);
        std::thread::yield_now();
    }

    let mut slot = GLOBAL.lock().unwrap();
    let inter = slot.as_mut().unwrap();
    inter.mode = CalibrationMode::Idle;
    Ok(inter.calibration.base_port_handle.expect("base_port_done implies a handle"))
}

fn run_phase3_address_transform(cccs: usize) -> Result<AddressXform, LpcError> {
    let timeout = {
        let mut slot = GLOBAL.lock().unwrap();
        let inter = slot.as_mut().unwrap();
        inter.mode = CalibrationMode::Calibrating;
        inter.calibration_timeout
    };

    let mut message = unsafe { std::mem::zeroed::<MessageData>() };
    let mut capture_buffer = unsafe { std::mem::zeroed::<CaptureBufferData>() };
    message.capture_buffer = &mut capture_buffer;
    let local_capture_buffer_address = &capture_buffer as *const _ as usize;

    let cccs_fn: CccsFn = unsafe { std::mem::transmute(cccs) };
    let started = Instant::now();
    unsafe {
        cccs_fn(&mut message, &mut capture_buffer, CALIBRATION_API_NUMBER, 0);
    }
    loop {
        let slot = GLOBAL.lock().unwrap();
        let inter = slot.as_ref().unwrap();
        if inter.calibration.calibration_done {
            break;
        }
        if started.elapsed() > timeout {
            return Err(LpcError::CalibrationTimeout { phase: "address_transform" });
        }
        drop(slot);
        std::thread::yield_now();
    }

    let mut slot = GLOBAL.lock().unwrap();
    let inter = slot.as_mut().unwrap();
    inter.mode = CalibrationMode::Idle;
    let remote = inter.calibration.calibration_remote_capture_buffer.expect("calibration_done implies a remote address");
    Ok(AddressXform::from_local_and_remote(local_capture_buffer_address, remote))
}

fn locate_nt_request_wait_reply_port() -> Result<usize, LpcError> {
    module_function_address(s!("ntdll.dll"), s!("NtRequestWaitReplyPort")).ok_or(LpcError::CalibrationFailed)
}

/// Installs the LPC patch and runs the three calibration phases. On any
/// failure the patch, if applied, is reverted before the error is returned,
/// leaving the process in its unpatched state.
///
/// `calibration_timeout` overrides [`DEFAULT_CALIBRATION_TIMEOUT`] for all
/// three phases; pass `None` to use the default.
pub fn install_lpc_interceptor(handler: Box<dyn LpcHandler>, calibration_timeout: Option<Duration>) -> Result<(), LpcError> {
    let original = locate_nt_request_wait_reply_port()?;
    let request = PatchRequest::new(
        original,
        nt_request_wait_reply_port_bridge as usize,
        PatchRequestFlags::MAKE_TRAMPOLINE,
    );
    let mut patches = PatchSet::new(WindowsMemoryManager::new(), vec![request]);
    patches.apply().map_err(LpcError::Patch)?;
    let trampoline = patches.request(0).trampoline().ok_or(LpcError::Patch(PatchError::WriteValidationFailed { address: original }))?;
    let trampoline: TrampolineFn = unsafe { std::mem::transmute(trampoline) };

    *GLOBAL.lock().unwrap() = Some(Interceptor {
        patches,
        trampoline,
        handler,
        enabled: false,
        console_port_handle: 0,
        base_port_handle: 0,
        xform: AddressXform::default(),
        mode: CalibrationMode::Idle,
        calibration: CalibrationScratch::default(),
        calibration_timeout: calibration_timeout.unwrap_or(DEFAULT_CALIBRATION_TIMEOUT),
    });

    match run_calibration() {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(mut inter) = GLOBAL.lock().unwrap().take() {
                let _ = inter.patches.revert();
            }
            Err(e)
        }
    }
}

fn run_calibration() -> Result<(), LpcError> {
    let (cccs, console_port_handle) = run_phase1_locate_cccs()?;
    let base_port_handle = run_phase2_determine_base_port()?;
    let xform = run_phase3_address_transform(cccs)?;

    let mut slot = GLOBAL.lock().unwrap();
    let inter = slot.as_mut().expect("interceptor installed before calibration");
    inter.console_port_handle = console_port_handle;
    inter.base_port_handle = base_port_handle;
    inter.xform = xform;
    inter.enabled = true;
    Ok(())
}

/// Reverts the LPC patch and clears the global interceptor. A no-op if no
/// interceptor is currently installed.
pub fn uninstall_lpc_interceptor() -> Result<(), LpcError> {
    let Some(mut inter) = GLOBAL.lock().unwrap().take() else {
        return Ok(());
    };
    inter.patches.revert().map_err(LpcError::Patch)
}
