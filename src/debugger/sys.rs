//! Thin wrappers around the Win32 debug interface.
//!
//! Everything here is a direct adapter: no policy, no state. The context
//! structure is declared by hand in its 32-bit x86 layout so that a 64-bit
//! debugger build can drive a WOW64 debuggee through the `Wow64*` context
//! calls.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::event::ContinueStatus;
use crate::debugger::register::{Register, RegisterFile};
use std::ffi::OsString;
use std::mem::{size_of, MaybeUninit};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::shared::winerror::ERROR_SEM_TIMEOUT;
use winapi::um::debugapi::{ContinueDebugEvent, WaitForDebugEvent};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::GetFinalPathNameByHandleW;
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::{ReadProcessMemory, VirtualProtectEx, WriteProcessMemory};
use winapi::um::minwinbase::{
    DEBUG_EVENT, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use winapi::um::processthreadsapi::{
    CreateProcessW, FlushInstructionCache, OpenThread, TerminateProcess, PROCESS_INFORMATION,
    STARTUPINFOW,
};
use winapi::um::psapi::GetModuleFileNameExW;
use winapi::um::winbase::{DEBUG_ONLY_THIS_PROCESS, DEBUG_PROCESS};
use winapi::um::winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE, THREAD_ALL_ACCESS};

pub const PAGE_EXECUTE_READWRITE: u32 = winapi::um::winnt::PAGE_EXECUTE_READWRITE;

const CONTEXT_I386: u32 = 0x0001_0000;
const CONTEXT_FULL: u32 = CONTEXT_I386 | 0x01 | 0x02 | 0x04;

/// The 32-bit x86 thread context, in the exact layout the kernel expects.
/// Identical to `WOW64_CONTEXT` on 64-bit hosts.
#[repr(C)]
pub struct X86Context {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: [u8; 112],
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    pub extended_registers: [u8; 512],
}

impl From<&X86Context> for RegisterFile {
    fn from(ctx: &X86Context) -> Self {
        RegisterFile {
            eax: ctx.eax,
            ebx: ctx.ebx,
            ecx: ctx.ecx,
            edx: ctx.edx,
            esi: ctx.esi,
            edi: ctx.edi,
            ebp: ctx.ebp,
            esp: ctx.esp,
            eip: ctx.eip,
            eflags: ctx.eflags,
        }
    }
}

pub fn update_context_register(ctx: &mut X86Context, register: Register, value: u32) {
    match register {
        Register::Eax => ctx.eax = value,
        Register::Ebx => ctx.ebx = value,
        Register::Ecx => ctx.ecx = value,
        Register::Edx => ctx.edx = value,
        Register::Esi => ctx.esi = value,
        Register::Edi => ctx.edi = value,
        Register::Ebp => ctx.ebp = value,
        Register::Esp => ctx.esp = value,
        Register::Eip => ctx.eip = value,
        Register::Eflags => ctx.eflags = value,
    }
}

#[cfg(target_arch = "x86_64")]
mod context_calls {
    use winapi::shared::minwindef::BOOL;
    use winapi::um::winnt::HANDLE;

    // Declared against WOW64_CONTEXT in the SDK; layout matches X86Context.
    extern "system" {
        pub fn Wow64GetThreadContext(thread: HANDLE, context: *mut super::X86Context) -> BOOL;
        pub fn Wow64SetThreadContext(thread: HANDLE, context: *const super::X86Context) -> BOOL;
    }
}

/// A debug event decoded into an owned representation, with the raw handles
/// the debugger must capture or close.
pub struct Event {
    pub process_id: u32,
    pub thread_id: u32,
    pub info: EventInfo,
}

pub enum EventInfo {
    CreateProcess {
        process: HANDLE,
        thread: HANDLE,
        base_address: u32,
        path: Option<PathBuf>,
    },
    CreateThread {
        thread: HANDLE,
    },
    LoadDll {
        base_address: u32,
        path: Option<PathBuf>,
    },
    UnloadDll {
        base_address: u32,
    },
    ExitThread,
    ExitProcess {
        exit_code: u32,
    },
    Exception {
        code: u32,
        address: u32,
        first_chance: bool,
    },
    OutputDebugString,
    Rip,
    Unknown(u32),
}

fn wide(s: &Path) -> Vec<u16> {
    s.as_os_str().encode_wide().chain(Some(0)).collect()
}

/// Launch a process with the debug flags set, so every debug event of the new
/// process is routed to the calling thread.
///
/// The Win32 debug interface binds the debuggee to the creating thread: all
/// subsequent wait/continue calls must come from this same thread.
pub fn create_process_for_debug(
    path: &Path,
    args: &[String],
) -> Result<(HANDLE, HANDLE, u32, u32), Error> {
    let app_name = wide(path);
    let mut cmd_line: Vec<u16> = {
        let mut line = format!("\"{}\"", path.display());
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        OsString::from(line).encode_wide().chain(Some(0)).collect()
    };

    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = size_of::<STARTUPINFOW>() as DWORD;
    let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessW(
            app_name.as_ptr(),
            cmd_line.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            FALSE,
            DEBUG_PROCESS | DEBUG_ONLY_THIS_PROCESS,
            ptr::null_mut(),
            ptr::null(),
            &mut startup_info,
            &mut process_info,
        )
    };
    if ok == FALSE {
        let code = unsafe { GetLastError() };
        return Err(Error::ProcessCreation {
            path: path.to_path_buf(),
            reason: format!("CreateProcessW failed (os error {code})"),
        });
    }
    if process_info.hProcess.is_null() {
        return Err(Error::InvalidHandle("process"));
    }
    if process_info.hThread.is_null() {
        return Err(Error::InvalidHandle("thread"));
    }

    Ok((
        process_info.hProcess,
        process_info.hThread,
        process_info.dwProcessId,
        process_info.dwThreadId,
    ))
}

/// Wait for the next debug event. Returns `None` on timeout.
///
/// `process_handle` is used to resolve module file names while decoding
/// load events; it is `None` until the create-process event arrives.
pub fn wait_for_debug_event(
    timeout_ms: u32,
    process_handle: Option<HANDLE>,
) -> Result<Option<Event>, Error> {
    let mut raw = MaybeUninit::<DEBUG_EVENT>::uninit();
    if unsafe { WaitForDebugEvent(raw.as_mut_ptr(), timeout_ms) } == FALSE {
        let code = unsafe { GetLastError() };
        if code == ERROR_SEM_TIMEOUT {
            return Ok(None);
        }
        return Err(Error::InvalidHandle("debug session"));
    }
    let raw = unsafe { raw.assume_init() };
    Ok(Some(decode_event(&raw, process_handle)))
}

fn decode_event(raw: &DEBUG_EVENT, process_handle: Option<HANDLE>) -> Event {
    let info = match raw.dwDebugEventCode {
        CREATE_PROCESS_DEBUG_EVENT => {
            let info = unsafe { raw.u.CreateProcessInfo() };
            let base_address = info.lpBaseOfImage as u32;
            let path = filename_from_handle(info.hFile).or_else(|| {
                get_module_filename(info.hProcess, info.lpBaseOfImage as usize)
            });
            if !info.hFile.is_null() {
                close_handle(info.hFile);
            }
            EventInfo::CreateProcess {
                process: info.hProcess,
                thread: info.hThread,
                base_address,
                path,
            }
        }
        CREATE_THREAD_DEBUG_EVENT => {
            let info = unsafe { raw.u.CreateThread() };
            EventInfo::CreateThread {
                thread: info.hThread,
            }
        }
        LOAD_DLL_DEBUG_EVENT => {
            let info = unsafe { raw.u.LoadDll() };
            let base_address = info.lpBaseOfDll as u32;
            // The file handle is ours to close per the debug API contract.
            let mut path = filename_from_handle(info.hFile);
            if !info.hFile.is_null() {
                close_handle(info.hFile);
            }
            if path.is_none() {
                path = process_handle
                    .and_then(|h| get_module_filename(h, info.lpBaseOfDll as usize));
            }
            EventInfo::LoadDll { base_address, path }
        }
        UNLOAD_DLL_DEBUG_EVENT => {
            let info = unsafe { raw.u.UnloadDll() };
            EventInfo::UnloadDll {
                base_address: info.lpBaseOfDll as u32,
            }
        }
        EXIT_THREAD_DEBUG_EVENT => EventInfo::ExitThread,
        EXIT_PROCESS_DEBUG_EVENT => {
            let info = unsafe { raw.u.ExitProcess() };
            EventInfo::ExitProcess {
                exit_code: info.dwExitCode,
            }
        }
        EXCEPTION_DEBUG_EVENT => {
            let info = unsafe { raw.u.Exception() };
            EventInfo::Exception {
                code: info.ExceptionRecord.ExceptionCode,
                address: info.ExceptionRecord.ExceptionAddress as u32,
                first_chance: info.dwFirstChance != 0,
            }
        }
        OUTPUT_DEBUG_STRING_EVENT => EventInfo::OutputDebugString,
        RIP_EVENT => EventInfo::Rip,
        code => EventInfo::Unknown(code),
    };

    Event {
        process_id: raw.dwProcessId,
        thread_id: raw.dwThreadId,
        info,
    }
}

pub fn continue_debug_event(
    process_id: u32,
    thread_id: u32,
    status: ContinueStatus,
) -> Result<(), Error> {
    let raw_status = match status {
        ContinueStatus::Handled => DBG_CONTINUE,
        ContinueStatus::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
    };
    if unsafe { ContinueDebugEvent(process_id, thread_id, raw_status) } == FALSE {
        return Err(Error::InvalidHandle("debug session"));
    }
    Ok(())
}

pub fn read_process_memory(
    process: HANDLE,
    addr: RelocatedAddress,
    size: usize,
) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; size];
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            addr.as_usize() as *const _,
            buf.as_mut_ptr() as *mut _,
            size,
            &mut read,
        )
    };
    if ok == FALSE || read != size {
        return Err(Error::MemoryRead {
            addr,
            size,
            code: unsafe { GetLastError() },
        });
    }
    Ok(buf)
}

pub fn write_process_memory(
    process: HANDLE,
    addr: RelocatedAddress,
    data: &[u8],
) -> Result<(), Error> {
    let mut written = 0usize;
    let ok = unsafe {
        WriteProcessMemory(
            process,
            addr.as_usize() as *mut _,
            data.as_ptr() as *const _,
            data.len(),
            &mut written,
        )
    };
    if ok == FALSE || written != data.len() {
        return Err(Error::MemoryWrite {
            addr,
            size: data.len(),
            code: unsafe { GetLastError() },
        });
    }
    Ok(())
}

/// Change page protection, returning the previous protection flags.
pub fn virtual_protect_ex(
    process: HANDLE,
    addr: RelocatedAddress,
    size: usize,
    protection: u32,
) -> Result<u32, Error> {
    let mut old = 0u32;
    let ok = unsafe {
        VirtualProtectEx(
            process,
            addr.as_usize() as *mut _,
            size,
            protection,
            &mut old,
        )
    };
    if ok == FALSE {
        return Err(Error::MemoryProtect {
            addr,
            code: unsafe { GetLastError() },
        });
    }
    Ok(old)
}

pub fn flush_instruction_cache(process: HANDLE, addr: RelocatedAddress, size: usize) {
    unsafe {
        FlushInstructionCache(process, addr.as_usize() as *const _, size);
    }
}

pub fn get_thread_context(thread: HANDLE) -> Result<X86Context, Error> {
    let mut ctx = MaybeUninit::<X86Context>::zeroed();
    unsafe {
        (*ctx.as_mut_ptr()).context_flags = CONTEXT_FULL;
    }
    #[cfg(target_arch = "x86_64")]
    let ok = unsafe { context_calls::Wow64GetThreadContext(thread, ctx.as_mut_ptr()) };
    #[cfg(target_arch = "x86")]
    let ok = unsafe {
        winapi::um::processthreadsapi::GetThreadContext(thread, ctx.as_mut_ptr() as *mut _)
    };
    if ok == FALSE {
        return Err(Error::InvalidHandle("thread"));
    }
    Ok(unsafe { ctx.assume_init() })
}

pub fn set_thread_context(thread: HANDLE, context: &X86Context) -> Result<(), Error> {
    #[cfg(target_arch = "x86_64")]
    let ok = unsafe { context_calls::Wow64SetThreadContext(thread, context) };
    #[cfg(target_arch = "x86")]
    let ok = unsafe {
        winapi::um::processthreadsapi::SetThreadContext(thread, context as *const _ as *const _)
    };
    if ok == FALSE {
        return Err(Error::InvalidHandle("thread"));
    }
    Ok(())
}

pub fn open_thread(thread_id: u32) -> Result<HANDLE, Error> {
    let handle = unsafe { OpenThread(THREAD_ALL_ACCESS, FALSE, thread_id) };
    if handle.is_null() {
        return Err(Error::ThreadNotFound(thread_id));
    }
    Ok(handle)
}

pub fn close_handle(handle: HANDLE) {
    if !handle.is_null() {
        unsafe {
            CloseHandle(handle);
        }
    }
}

pub fn terminate_process(process: HANDLE) -> Result<(), Error> {
    if unsafe { TerminateProcess(process, 1) } == FALSE {
        return Err(Error::InvalidHandle("process"));
    }
    Ok(())
}

pub fn get_module_filename(process: HANDLE, module_base: usize) -> Option<PathBuf> {
    let mut buf = [0u16; 1024];
    let len = unsafe {
        GetModuleFileNameExW(
            process,
            module_base as *mut _,
            buf.as_mut_ptr(),
            buf.len() as DWORD,
        )
    };
    if len == 0 {
        return None;
    }
    Some(PathBuf::from(OsString::from_wide(&buf[..len as usize])))
}

/// Resolve the on-disk path of an image from its open file handle.
pub fn filename_from_handle(file: HANDLE) -> Option<PathBuf> {
    if file.is_null() {
        return None;
    }
    let mut buf = [0u16; 1024];
    let len =
        unsafe { GetFinalPathNameByHandleW(file, buf.as_mut_ptr(), buf.len() as DWORD, 0) };
    if len == 0 || len as usize > buf.len() {
        return None;
    }
    let path = OsString::from_wide(&buf[..len as usize]);
    let path = path.to_string_lossy();
    // GetFinalPathNameByHandleW yields an extended-length `\\?\C:\...` path.
    Some(PathBuf::from(
        path.strip_prefix(r"\\?\").unwrap_or(&path).to_string(),
    ))
}
