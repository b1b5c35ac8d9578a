use crate::debugger::address::RelocatedAddress;
use std::path::PathBuf;

/// Breakpoint exception raised by an int3 instruction.
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
/// Single-step exception raised when the trap flag is set.
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
/// WOW64 mirror of [`EXCEPTION_BREAKPOINT`], raised for 32-bit debuggees on 64-bit hosts.
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;
/// WOW64 mirror of [`EXCEPTION_SINGLE_STEP`].
pub const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001E;

pub fn is_breakpoint_code(code: u32) -> bool {
    code == EXCEPTION_BREAKPOINT || code == STATUS_WX86_BREAKPOINT
}

pub fn is_single_step_code(code: u32) -> bool {
    code == EXCEPTION_SINGLE_STEP || code == STATUS_WX86_SINGLE_STEP
}

/// How the debug event must be acknowledged to the operating system.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContinueStatus {
    /// The exception was handled by the debugger.
    Handled,
    /// Return the exception to the debuggee's own handlers.
    NotHandled,
}

/// A debug event, decoded from the OS representation into an owned form so
/// the dispatcher does not depend on the host debug interface.
#[derive(Debug)]
pub enum DebugEvent {
    CreateProcess {
        base_address: RelocatedAddress,
        thread_id: u32,
        path: Option<PathBuf>,
    },
    CreateThread {
        thread_id: u32,
    },
    LoadDll {
        base_address: RelocatedAddress,
        path: Option<PathBuf>,
    },
    UnloadDll {
        base_address: RelocatedAddress,
    },
    ExitThread {
        thread_id: u32,
    },
    ExitProcess {
        exit_code: u32,
    },
    OutputDebugString,
    Exception {
        code: u32,
        address: RelocatedAddress,
        thread_id: u32,
        first_chance: bool,
    },
    Rip,
}
