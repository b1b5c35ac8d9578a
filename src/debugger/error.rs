use crate::debugger::address::RelocatedAddress;
use crate::debugger::state::DebuggerState;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- process creation ------------------------------------------
    #[error("fail to create debuggee process `{path}`: {reason}")]
    ProcessCreation { path: PathBuf, reason: String },
    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),
    #[error("debuggee process is not started")]
    ProcessNotStarted,
    #[error("debuggee process exited with code {0}")]
    ProcessExit(u32),

    // --------------------------------- handle errors ---------------------------------------------
    #[error("invalid {0} handle, the debuggee may have exited")]
    InvalidHandle(&'static str),
    #[error("thread {0} not found")]
    ThreadNotFound(u32),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("fail to read {size} bytes at {addr} (os error {code})")]
    MemoryRead {
        addr: RelocatedAddress,
        size: usize,
        code: u32,
    },
    #[error("fail to write {size} bytes at {addr} (os error {code})")]
    MemoryWrite {
        addr: RelocatedAddress,
        size: usize,
        code: u32,
    },
    #[error("fail to change page protection at {addr} (os error {code})")]
    MemoryProtect { addr: RelocatedAddress, code: u32 },

    // --------------------------------- register errors -------------------------------------------
    #[error("unknown dwarf register number {0}")]
    RegisterNotFound(u16),
    #[error("unknown register `{0}`")]
    RegisterNameNotFound(String),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("breakpoint already exists at {0}")]
    BreakpointDuplicate(RelocatedAddress),
    #[error("pending breakpoint already exists for `{0}`")]
    BreakpointPendingDuplicate(String),
    #[error("breakpoint verification failed at {addr}: wrote 0xCC but read back {read_back:#04x}")]
    BreakpointVerification { addr: RelocatedAddress, read_back: u8 },
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("invalid breakpoint location `{0}` (expected 0xADDR, module:offset or file:line)")]
    InvalidLocation(String),

    // --------------------------------- module / debug info errors --------------------------------
    #[error("module `{0}` not found in debuggee")]
    ModuleNotFound(String),
    #[error("no source place for {file}:{line} in any loaded module")]
    PlaceNotFound { file: String, line: u64 },
    #[error("no debug information for {0}")]
    NoDebugInformation(String),
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- dwarf evaluation errors -----------------------------------
    #[error("location expression evaluation: {0}")]
    LocationEval(#[from] crate::dwarf::eval::EvalError),
    #[error("no frame base address")]
    NoFrameBase,

    // --------------------------------- session lifecycle errors ----------------------------------
    #[error("operation `{operation}` is invalid while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: DebuggerState,
    },
    #[error("timeout waiting for `{0}`")]
    Timeout(&'static str),
    #[error("session not found")]
    SessionNotFound,
    #[error("command execution: {0}")]
    Command(String),
    #[error("source file not found: {0}")]
    SourceNotFound(String),
}

impl Error {
    /// Return a hint for the session layer: tear the session down or keep serving requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProcessCreation { .. }
                | Error::InvalidHandle(_)
                | Error::ProcessExit(_)
        )
    }
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}
