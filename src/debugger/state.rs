use crate::debugger::address::RelocatedAddress;
use serde::Serialize;
use strum_macros::Display;

/// Debuggee execution states as observed by the session layer.
///
/// Transitions between `Running`, `Stopped` and `Exited` are the
/// synchronization primitive between the event-loop worker and request
/// handlers: the worker idles while `Stopped`, handlers set `Running` and
/// poll for the next transition.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DebuggerState {
    NotStarted,
    Running,
    Stopped,
    Step,
    Exited,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Initial system breakpoint, image loading complete.
    Entry,
    /// One of our breakpoints was hit.
    Breakpoint,
    /// User requested single instruction step completed.
    Step,
    /// Second-chance exception in the debuggee.
    Exception,
    /// Debuggee terminated.
    Exit,
}

/// Why and where the debuggee stopped.
#[derive(Clone, Debug)]
pub struct StopInfo {
    pub reason: StopReason,
    pub address: Option<RelocatedAddress>,
    pub thread_id: Option<u32>,
    pub exception_code: Option<u32>,
    pub module_name: Option<String>,
}

impl StopInfo {
    pub fn new(reason: StopReason, address: RelocatedAddress, thread_id: u32) -> Self {
        Self {
            reason,
            address: Some(address),
            thread_id: Some(thread_id),
            exception_code: None,
            module_name: None,
        }
    }

    pub fn with_module(mut self, module_name: Option<String>) -> Self {
        self.module_name = module_name;
        self
    }

    pub fn with_exception_code(mut self, code: u32) -> Self {
        self.exception_code = Some(code);
        self
    }
}

/// Shared debugger context: lifecycle state, stop information and the
/// current execution position.
#[derive(Debug)]
pub struct DebuggerContext {
    state: DebuggerState,
    stop_info: Option<StopInfo>,
    pub current_thread_id: Option<u32>,
    pub current_address: Option<RelocatedAddress>,
    pub process_id: Option<u32>,
    pub should_quit: bool,
    pub step_mode: bool,
    exit_code: Option<u32>,
}

impl Default for DebuggerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerContext {
    pub fn new() -> Self {
        Self {
            state: DebuggerState::NotStarted,
            stop_info: None,
            current_thread_id: None,
            current_address: None,
            process_id: None,
            should_quit: false,
            step_mode: false,
            exit_code: None,
        }
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn stop_info(&self) -> Option<&StopInfo> {
        self.stop_info.as_ref()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    pub fn set_running(&mut self) {
        self.state = DebuggerState::Running;
        self.stop_info = None;
    }

    pub fn set_stopped(&mut self, stop: StopInfo) {
        if let Some(addr) = stop.address {
            self.current_address = Some(addr);
        }
        if let Some(tid) = stop.thread_id {
            self.current_thread_id = Some(tid);
        }
        self.state = DebuggerState::Stopped;
        self.stop_info = Some(stop);
    }

    pub fn set_step_mode(&mut self, enabled: bool) {
        self.step_mode = enabled;
        if enabled {
            self.state = DebuggerState::Step;
        }
    }

    pub fn set_exited(&mut self, exit_code: u32) {
        self.state = DebuggerState::Exited;
        self.exit_code = Some(exit_code);
        self.stop_info = Some(StopInfo {
            reason: StopReason::Exit,
            address: None,
            thread_id: None,
            exception_code: Some(exit_code),
            module_name: None,
        });
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, DebuggerState::Running | DebuggerState::Step)
    }

    pub fn is_stopped(&self) -> bool {
        self.state == DebuggerState::Stopped
    }

    pub fn is_exited(&self) -> bool {
        self.state == DebuggerState::Exited
    }
}
