//! Window-to-process resolution and forced termination via Win32.

#![cfg(windows)]

use std::ffi::c_void;

use windows::Win32::{
    Foundation::{CloseHandle, ERROR_INVALID_PARAMETER, HANDLE, HWND, WAIT_OBJECT_0, WAIT_TIMEOUT},
    System::Threading::{
        OpenProcess, TerminateProcess, WaitForSingleObject, PROCESS_SYNCHRONIZE,
        PROCESS_TERMINATE,
    },
    UI::WindowsAndMessaging::GetWindowThreadProcessId,
};

use sheetpilot_protocol::TerminationOutcome;

/// Process that created `window`, or `None` when the window no longer exists.
pub fn resolve_process_id(window: i64) -> Option<u32> {
    let mut pid = 0u32;
    let thread = unsafe { GetWindowThreadProcessId(HWND(window as isize as *mut c_void), Some(&mut pid)) };
    (thread != 0 && pid != 0).then_some(pid)
}

/// Kill `pid` and wait up to `timeout_ms` for the OS to report it gone.
pub fn terminate(pid: u32, timeout_ms: u64) -> Result<TerminationOutcome, String> {
    let handle = match unsafe { OpenProcess(PROCESS_TERMINATE | PROCESS_SYNCHRONIZE, false, pid) } {
        Ok(handle) => handle,
        // No such process.
        Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
            return Ok(TerminationOutcome::NotRunning)
        }
        Err(e) => return Err(format!("OpenProcess({pid}) failed: {e}")),
    };

    let outcome = kill_and_wait(handle, pid, timeout_ms);
    unsafe {
        let _ = CloseHandle(handle);
    }
    outcome
}

fn kill_and_wait(handle: HANDLE, pid: u32, timeout_ms: u64) -> Result<TerminationOutcome, String> {
    // Fails with access denied when the process is already exiting; the wait decides.
    if let Err(e) = unsafe { TerminateProcess(handle, 1) } {
        eprintln!("[sheetpilot-bridge] TerminateProcess({pid}): {e}");
    }

    let timeout = u32::try_from(timeout_ms).unwrap_or(u32::MAX - 1);
    let wait = unsafe { WaitForSingleObject(handle, timeout) };
    if wait == WAIT_OBJECT_0 {
        Ok(TerminationOutcome::Exited)
    } else if wait == WAIT_TIMEOUT {
        Ok(TerminationOutcome::TimedOut)
    } else {
        Err(format!("WaitForSingleObject({pid}) returned {:#x}", wait.0))
    }
}
