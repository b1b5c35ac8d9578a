pub mod address;
pub mod breakpoint;
pub mod error;
pub mod event;
#[cfg(test)]
pub(crate) mod mock;
pub mod module;
pub mod process;
pub mod register;
pub mod state;
#[cfg(windows)]
pub mod sys;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointEngine;
use crate::debugger::error::Error;
use crate::debugger::event::{is_breakpoint_code, is_single_step_code, ContinueStatus, DebugEvent};
use crate::debugger::module::ModuleManager;
use crate::debugger::process::ProcessAccess;
use crate::debugger::register::{Register, TRAP_FLAG};
use crate::debugger::state::{DebuggerContext, StopInfo, StopReason};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::Sender;

/// The debugger core: event dispatch policy over a debuggee process.
///
/// Generic over the process access so the policy is testable without a live
/// Win32 debuggee; the event pump itself lives in the `cfg(windows)` impl
/// below and must run on the thread that created the debuggee.
pub struct Debugger<P: ProcessAccess> {
    pub process: P,
    pub modules: ModuleManager,
    pub breakpoints: BreakpointEngine,
    pub context: DebuggerContext,
    executable: PathBuf,
    /// The OS notifies image-load completion with one synthetic breakpoint;
    /// the first unknown breakpoint is that notification.
    initial_breakpoint_seen: bool,
    /// One-shot channel fired on the entry stop so the run request can return.
    entry_notifier: Option<Sender<StopInfo>>,
    continue_status: ContinueStatus,
    /// The (process, thread) pair of the event that has not been acknowledged
    /// yet. Held back while the session is stopped so the OS keeps the
    /// debuggee paused.
    pending_ack: Option<(u32, u32)>,
}

impl<P: ProcessAccess> Debugger<P> {
    pub fn with_process(process: P, executable: PathBuf) -> Self {
        Self {
            process,
            modules: ModuleManager::new(),
            breakpoints: BreakpointEngine::new(),
            context: DebuggerContext::new(),
            executable,
            initial_breakpoint_seen: false,
            entry_notifier: None,
            continue_status: ContinueStatus::Handled,
            pending_ack: None,
        }
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    pub fn set_entry_notifier(&mut self, notifier: Sender<StopInfo>) {
        self.entry_notifier = Some(notifier);
    }

    /// How the last dispatched event must be acknowledged.
    pub fn continue_status(&self) -> ContinueStatus {
        self.continue_status
    }

    pub fn reset_continue_status(&mut self) {
        self.continue_status = ContinueStatus::Handled;
    }

    /// Demultiplex one debug event. Events arrive in OS delivery order;
    /// pending-breakpoint resolution is completed before this returns, so no
    /// later event observes a half-resolved state.
    pub fn dispatch(&mut self, event: DebugEvent) -> Result<(), Error> {
        match event {
            DebugEvent::CreateProcess {
                base_address,
                thread_id,
                path,
            } => {
                let path = path.unwrap_or_else(|| self.executable.clone());
                let name = basename(&path);
                self.modules
                    .on_module_loaded(name, base_address.as_u32(), path, 0);
                self.context.current_thread_id = Some(thread_id);
                self.context.current_address = Some(base_address);
                // No stop: the entry stop happens at the initial breakpoint,
                // after the loader finished mapping images.
            }
            DebugEvent::CreateThread { thread_id } => {
                debug!(target: "debugger", "thread {thread_id} created");
            }
            DebugEvent::LoadDll { base_address, path } => {
                let (name, path) = match path {
                    Some(path) => (basename(&path), path),
                    None => (
                        format!("module_{:#010x}", base_address.as_u32()),
                        PathBuf::new(),
                    ),
                };
                self.modules
                    .on_module_loaded(name.clone(), base_address.as_u32(), path, 0);
                let resolved = self.breakpoints.resolve_pending_for_module(
                    &mut self.process,
                    &self.modules,
                    &name,
                );
                if !resolved.is_empty() {
                    info!(
                        target: "debugger",
                        "resolved {} pending breakpoint(s) for {name}",
                        resolved.len()
                    );
                }
            }
            DebugEvent::UnloadDll { base_address } => {
                if let Some(module) = self.modules.on_module_unloaded(base_address.as_u32()) {
                    self.breakpoints.unpend_for_module(&module.name);
                }
            }
            DebugEvent::ExitThread { thread_id } => {
                debug!(target: "debugger", "thread {thread_id} exited");
            }
            DebugEvent::ExitProcess { exit_code } => {
                info!(target: "debugger", "debuggee exited with code {exit_code}");
                self.context.set_exited(exit_code);
            }
            DebugEvent::OutputDebugString | DebugEvent::Rip => {}
            DebugEvent::Exception {
                code,
                address,
                thread_id,
                first_chance,
            } => {
                self.dispatch_exception(code, address, thread_id, first_chance)?;
            }
        }
        Ok(())
    }

    fn dispatch_exception(
        &mut self,
        code: u32,
        address: RelocatedAddress,
        thread_id: u32,
        first_chance: bool,
    ) -> Result<(), Error> {
        debug!(
            target: "debugger",
            "exception {code:#010x} at {address}, thread {thread_id}, first_chance={first_chance}"
        );

        if is_breakpoint_code(code) {
            return self.handle_breakpoint(address, thread_id, first_chance);
        }
        if is_single_step_code(code) {
            return self.handle_single_step(address, thread_id);
        }

        if first_chance {
            // Hand the exception back to the debuggee's own handlers.
            self.continue_status = ContinueStatus::NotHandled;
        } else {
            self.context.set_stopped(
                StopInfo::new(StopReason::Exception, address, thread_id)
                    .with_exception_code(code),
            );
        }
        Ok(())
    }

    fn handle_breakpoint(
        &mut self,
        address: RelocatedAddress,
        thread_id: u32,
        first_chance: bool,
    ) -> Result<(), Error> {
        if let Some(bp) = self
            .breakpoints
            .on_hit(&mut self.process, address, thread_id)?
        {
            info!(target: "debugger", "breakpoint {} hit at {address}", bp.id);
            self.context.set_stopped(
                StopInfo::new(StopReason::Breakpoint, address, thread_id)
                    .with_module(bp.module_name.clone()),
            );
            return Ok(());
        }

        if !self.initial_breakpoint_seen {
            // The synthetic image-loading-complete notification.
            info!(target: "debugger", "initial breakpoint at {address} (entry)");
            self.initial_breakpoint_seen = true;
            let stop = StopInfo::new(StopReason::Entry, address, thread_id);
            self.context.set_stopped(stop.clone());
            if let Some(notifier) = self.entry_notifier.take() {
                let _ = notifier.send(stop);
            }
        } else if first_chance {
            // Not ours, continue silently.
            debug!(target: "debugger", "unknown first-chance breakpoint at {address}, continued");
        } else {
            warn!(target: "debugger", "unknown second-chance breakpoint at {address}");
            self.context
                .set_stopped(StopInfo::new(StopReason::Breakpoint, address, thread_id));
        }
        Ok(())
    }

    fn handle_single_step(
        &mut self,
        address: RelocatedAddress,
        thread_id: u32,
    ) -> Result<(), Error> {
        if self
            .breakpoints
            .rearm_after_step(&mut self.process, thread_id)?
        {
            // Transparent re-arm: the debuggee resumes without a stop.
            self.context.current_thread_id = Some(thread_id);
            self.context.current_address = Some(address);
            return Ok(());
        }

        if self.context.step_mode {
            let eflags = self.process.register(thread_id, Register::Eflags)?;
            self.process
                .set_register(thread_id, Register::Eflags, eflags & !TRAP_FLAG)?;
            self.context.set_step_mode(false);
            self.context
                .set_stopped(StopInfo::new(StopReason::Step, address, thread_id));
            return Ok(());
        }

        // Spurious single-step: image loading and thread creation emit these
        // on WOW64. The trap flag must be cleared or every following
        // instruction traps.
        debug!(target: "debugger", "spurious single-step at {address}, absorbed");
        let eflags = self.process.register(thread_id, Register::Eflags)?;
        if eflags & TRAP_FLAG != 0 {
            self.process
                .set_register(thread_id, Register::Eflags, eflags & !TRAP_FLAG)?;
        }
        self.context.current_thread_id = Some(thread_id);
        self.context.current_address = Some(address);
        Ok(())
    }

    /// Arm the trap flag on the current thread and flip into step mode.
    /// The next single-step exception stops with reason `step`.
    pub fn prepare_step(&mut self) -> Result<(), Error> {
        let thread_id = self
            .context
            .current_thread_id
            .ok_or(Error::ProcessNotStarted)?;
        let eflags = self.process.register(thread_id, Register::Eflags)?;
        self.process
            .set_register(thread_id, Register::Eflags, eflags | TRAP_FLAG)?;
        self.context.set_step_mode(true);
        Ok(())
    }
}

fn basename(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(windows)]
mod pump {
    use super::*;
    use crate::debugger::process::ProcessController;
    use crate::debugger::sys;

    /// Wait timeout, short enough that cancellation and resume requests are
    /// observed promptly.
    const EVENT_WAIT_MS: u32 = 100;

    impl Debugger<ProcessController> {
        pub fn new(executable: PathBuf) -> Result<Self, Error> {
            if !executable.exists() {
                return Err(Error::ExecutableNotFound(executable));
            }
            Ok(Self::with_process(ProcessController::new(), executable))
        }

        /// Create the debuggee. Must be called on the same thread that will
        /// pump events: the OS binds the debug session to this thread.
        pub fn start(&mut self, args: &[String]) -> Result<(), Error> {
            let (process_handle, thread_handle, process_id, thread_id) =
                sys::create_process_for_debug(&self.executable, args)?;
            info!(target: "debugger", "debuggee created, pid {process_id}");

            self.process.bind_process(process_handle, process_id);
            self.process.add_thread(thread_id, thread_handle);
            self.context.process_id = Some(process_id);
            self.context.current_thread_id = Some(thread_id);
            self.context.set_running();
            Ok(())
        }

        /// One pump iteration: acknowledge the outstanding event, then wait
        /// up to [`EVENT_WAIT_MS`] for the next one and dispatch it.
        ///
        /// Must only be called while the session is not stopped (and from the
        /// thread that created the debuggee): while stopped, the pending
        /// event stays unacknowledged so the OS keeps the debuggee paused.
        pub fn pump_once(&mut self) -> Result<(), Error> {
            if let Some((process_id, thread_id)) = self.pending_ack.take() {
                sys::continue_debug_event(process_id, thread_id, self.continue_status)?;
                self.reset_continue_status();
            }

            let process_handle = self.process.process_handle().ok();
            if let Some(event) = sys::wait_for_debug_event(EVENT_WAIT_MS, process_handle)? {
                self.pending_ack = Some((event.process_id, event.thread_id));
                let portable = self.capture(event);
                self.dispatch(portable)?;
            }
            Ok(())
        }

        /// Acknowledge the final event (normally exit-process) so the OS
        /// finishes detaching from the debuggee.
        pub fn acknowledge_final(&mut self) {
            if let Some((process_id, thread_id)) = self.pending_ack.take() {
                let _ = sys::continue_debug_event(process_id, thread_id, self.continue_status);
            }
        }

        /// Capture OS handles carried by the raw event and convert it into
        /// the portable representation the dispatcher consumes.
        fn capture(&mut self, event: sys::Event) -> DebugEvent {
            let thread_id = event.thread_id;
            match event.info {
                sys::EventInfo::CreateProcess {
                    process,
                    thread,
                    base_address,
                    path,
                } => {
                    self.process.bind_process(process, event.process_id);
                    self.process.add_thread(thread_id, thread);
                    self.context.process_id = Some(event.process_id);
                    DebugEvent::CreateProcess {
                        base_address: base_address.into(),
                        thread_id,
                        path,
                    }
                }
                sys::EventInfo::CreateThread { thread } => {
                    self.process.add_thread(thread_id, thread);
                    DebugEvent::CreateThread { thread_id }
                }
                sys::EventInfo::LoadDll { base_address, path } => DebugEvent::LoadDll {
                    base_address: base_address.into(),
                    path,
                },
                sys::EventInfo::UnloadDll { base_address } => DebugEvent::UnloadDll {
                    base_address: base_address.into(),
                },
                sys::EventInfo::ExitThread => {
                    self.process.remove_thread(thread_id);
                    DebugEvent::ExitThread { thread_id }
                }
                sys::EventInfo::ExitProcess { exit_code } => DebugEvent::ExitProcess { exit_code },
                sys::EventInfo::Exception {
                    code,
                    address,
                    first_chance,
                } => DebugEvent::Exception {
                    code,
                    address: address.into(),
                    thread_id,
                    first_chance,
                },
                sys::EventInfo::OutputDebugString => DebugEvent::OutputDebugString,
                sys::EventInfo::Rip | sys::EventInfo::Unknown(_) => DebugEvent::Rip,
            }
        }

        /// Terminate the debuggee; the pump then receives exit-process and
        /// leaves the loop.
        pub fn terminate(&mut self) {
            self.context.should_quit = true;
            if !self.context.is_exited() {
                if let Err(e) = self.process.terminate() {
                    warn!(target: "debugger", "terminate failed: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::event::{
        EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP, STATUS_WX86_SINGLE_STEP,
    };
    use crate::debugger::mock::FakeProcess;
    use crate::debugger::state::DebuggerState;
    use std::sync::mpsc;

    fn debugger() -> Debugger<FakeProcess> {
        let mut process = FakeProcess::new();
        process.set_register(1, Register::Eflags, 0x202);
        Debugger::with_process(process, PathBuf::from("plague.exe"))
    }

    fn exception(code: u32, address: u32, first_chance: bool) -> DebugEvent {
        DebugEvent::Exception {
            code,
            address: address.into(),
            thread_id: 1,
            first_chance,
        }
    }

    #[test]
    fn test_first_unknown_breakpoint_is_entry_stop() {
        let mut debugger = debugger();
        let (tx, rx) = mpsc::channel();
        debugger.set_entry_notifier(tx);

        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x77a0_1234, true))
            .unwrap();

        assert_eq!(debugger.context.state(), DebuggerState::Stopped);
        let stop = debugger.context.stop_info().unwrap();
        assert_eq!(stop.reason, StopReason::Entry);
        assert_eq!(stop.address, Some(0x77a0_1234.into()));
        let notified = rx.try_recv().unwrap();
        assert_eq!(notified.reason, StopReason::Entry);
    }

    #[test]
    fn test_subsequent_unknown_breakpoints_continue_silently() {
        let mut debugger = debugger();
        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x77a0_1234, true))
            .unwrap();
        debugger.context.set_running();

        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x77a0_9999, true))
            .unwrap();
        assert_eq!(debugger.context.state(), DebuggerState::Running);
        assert_eq!(debugger.continue_status(), ContinueStatus::Handled);
    }

    #[test]
    fn test_unknown_second_chance_breakpoint_stops() {
        let mut debugger = debugger();
        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x77a0_1234, true))
            .unwrap();
        debugger.context.set_running();

        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x77a0_9999, false))
            .unwrap();
        let stop = debugger.context.stop_info().unwrap();
        assert_eq!(stop.reason, StopReason::Breakpoint);
    }

    #[test]
    fn test_own_breakpoint_hit_stops_at_patch_address() {
        let mut debugger = debugger();
        debugger.process.map_bytes(0x401000, &[0x55]);
        debugger.process.set_register(1, Register::Eip, 0x401001);
        debugger
            .breakpoints
            .set_at_address(&mut debugger.process, &debugger.modules, 0x401000.into())
            .unwrap();

        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x401000, true))
            .unwrap();

        let stop = debugger.context.stop_info().unwrap();
        assert_eq!(stop.reason, StopReason::Breakpoint);
        // The reported address is the patch address, not patch address + 1.
        assert_eq!(stop.address, Some(0x401000.into()));
        assert_eq!(
            debugger.process.register(1, Register::Eip).unwrap(),
            0x401000
        );
    }

    #[test]
    fn test_single_step_rearms_transparently_without_stop() {
        let mut debugger = debugger();
        debugger.process.map_bytes(0x401000, &[0x55]);
        debugger.process.set_register(1, Register::Eip, 0x401001);
        debugger
            .breakpoints
            .set_at_address(&mut debugger.process, &debugger.modules, 0x401000.into())
            .unwrap();
        debugger
            .dispatch(exception(EXCEPTION_BREAKPOINT, 0x401000, true))
            .unwrap();
        debugger.context.set_running();

        debugger
            .dispatch(exception(EXCEPTION_SINGLE_STEP, 0x401001, true))
            .unwrap();

        assert_eq!(debugger.context.state(), DebuggerState::Running);
        assert_eq!(debugger.process.byte_at(0x401000), breakpoint::INT3);
        assert_eq!(
            debugger.process.register(1, Register::Eflags).unwrap() & TRAP_FLAG,
            0
        );
    }

    #[test]
    fn test_spurious_wow64_single_step_absorbed_and_trap_flag_cleared() {
        let mut debugger = debugger();
        debugger
            .process
            .set_register(1, Register::Eflags, 0x202 | TRAP_FLAG);
        debugger.context.set_running();

        debugger
            .dispatch(exception(STATUS_WX86_SINGLE_STEP, 0x77a0_5555, true))
            .unwrap();

        assert_eq!(debugger.context.state(), DebuggerState::Running);
        assert_eq!(
            debugger.process.register(1, Register::Eflags).unwrap() & TRAP_FLAG,
            0
        );
    }

    #[test]
    fn test_user_step_stops_with_step_reason() {
        let mut debugger = debugger();
        debugger.context.current_thread_id = Some(1);
        debugger.prepare_step().unwrap();
        assert_ne!(
            debugger.process.register(1, Register::Eflags).unwrap() & TRAP_FLAG,
            0
        );

        debugger
            .dispatch(exception(EXCEPTION_SINGLE_STEP, 0x401005, true))
            .unwrap();

        let stop = debugger.context.stop_info().unwrap();
        assert_eq!(stop.reason, StopReason::Step);
        assert!(!debugger.context.step_mode);
        assert_eq!(
            debugger.process.register(1, Register::Eflags).unwrap() & TRAP_FLAG,
            0
        );
    }

    #[test]
    fn test_first_chance_exception_returned_to_debuggee() {
        let mut debugger = debugger();
        debugger.context.set_running();
        debugger
            .dispatch(exception(0xC000_0005, 0x401000, true))
            .unwrap();
        assert_eq!(debugger.continue_status(), ContinueStatus::NotHandled);
        assert_eq!(debugger.context.state(), DebuggerState::Running);
    }

    #[test]
    fn test_second_chance_exception_stops_with_code() {
        let mut debugger = debugger();
        debugger.context.set_running();
        debugger
            .dispatch(exception(0xC000_0005, 0x401000, false))
            .unwrap();
        let stop = debugger.context.stop_info().unwrap();
        assert_eq!(stop.reason, StopReason::Exception);
        assert_eq!(stop.exception_code, Some(0xC000_0005));
    }

    #[test]
    fn test_exit_process_sets_exited() {
        let mut debugger = debugger();
        debugger
            .dispatch(DebugEvent::ExitProcess { exit_code: 3 })
            .unwrap();
        assert!(debugger.context.is_exited());
        assert_eq!(debugger.context.exit_code(), Some(3));
    }

    #[test]
    fn test_load_dll_resolves_pending_breakpoint() {
        let mut debugger = debugger();
        debugger
            .breakpoints
            .set_deferred(&mut debugger.process, &debugger.modules, "testdll.dll:0x100")
            .unwrap();
        debugger.process.map_bytes(0x1000_0100, &[0x8b]);

        debugger
            .dispatch(DebugEvent::LoadDll {
                base_address: 0x1000_0000.into(),
                path: Some(PathBuf::from("C:\\games\\testdll.dll")),
            })
            .unwrap();

        let bp = debugger
            .breakpoints
            .breakpoint_at(0x1000_0100.into())
            .unwrap();
        assert_eq!(bp.status, breakpoint::BreakpointStatus::Active);
        assert_eq!(debugger.process.byte_at(0x1000_0100), breakpoint::INT3);
    }

    #[test]
    fn test_unload_dll_unpends_breakpoints() {
        let mut debugger = debugger();
        debugger.process.map_bytes(0x1000_0100, &[0x8b]);
        debugger
            .dispatch(DebugEvent::LoadDll {
                base_address: 0x1000_0000.into(),
                path: Some(PathBuf::from("C:\\games\\testdll.dll")),
            })
            .unwrap();
        debugger
            .breakpoints
            .set_deferred(&mut debugger.process, &debugger.modules, "testdll.dll:0x100")
            .unwrap();

        debugger
            .dispatch(DebugEvent::UnloadDll {
                base_address: 0x1000_0000.into(),
            })
            .unwrap();

        assert!(debugger.modules.module_by_name("testdll.dll").is_none());
        let bps = debugger.breakpoints.list();
        assert_eq!(bps.len(), 1);
        assert_eq!(bps[0].status, breakpoint::BreakpointStatus::Pending);
    }
}
