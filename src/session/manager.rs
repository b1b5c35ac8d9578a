use crate::cfg::SessionConfig;
use crate::debugger::error::Error;
use crate::debugger::process::{ProcessAccess, ProcessController};
use crate::debugger::register::RegisterFile;
use crate::debugger::state::DebuggerState;
use crate::debugger::Debugger;
use crate::dwarf::variable::{Variable, VariableInspector};
use crate::session::proto::{BreakpointView, ModuleView, SourceExcerpt, StopEvent};
use crate::session::source::SourceResolver;
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Commands that must execute on the worker thread while the debuggee runs.
/// Continue/step/stop travel through state transitions instead.
enum Command {
    SetBreakpoint {
        location: String,
        reply: Sender<Result<BreakpointView, String>>,
    },
    ClearBreakpoint {
        id: u32,
        reply: Sender<Result<(), String>>,
    },
}

/// One debugging session: a debuggee, its module and breakpoint state, and
/// the worker thread that owns every debug-API call for it.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    args: Vec<String>,
    debugger: Arc<Mutex<Debugger<ProcessController>>>,
    source: Mutex<SourceResolver>,
    worker: Mutex<Option<JoinHandle<()>>>,
    command_tx: Sender<Command>,
    command_rx: Mutex<Option<Receiver<Command>>>,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
}

impl Session {
    fn new(
        config: SessionConfig,
        executable: PathBuf,
        args: Vec<String>,
        source_dirs: Vec<PathBuf>,
    ) -> Result<Self, Error> {
        let debugger = Debugger::new(executable)?;

        let mut source = SourceResolver::new();
        for dir in config.source_directories.iter().chain(source_dirs.iter()) {
            source.add_directory(dir.clone());
        }

        let (command_tx, command_rx) = mpsc::channel();
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            args,
            debugger: Arc::new(Mutex::new(debugger)),
            source: Mutex::new(source),
            worker: Mutex::new(None),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            created_at: Instant::now(),
            last_accessed: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn touch(&self) {
        *self.last_accessed.lock().expect("session poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_accessed
            .lock()
            .expect("session poisoned")
            .elapsed()
    }

    fn lock_debugger(&self) -> std::sync::MutexGuard<'_, Debugger<ProcessController>> {
        self.debugger.lock().expect("debugger mutex poisoned")
    }

    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .expect("session poisoned")
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Launch the debuggee and wait for the entry stop.
    ///
    /// The worker thread created here performs both process creation and
    /// event pumping: the OS requires wait/continue calls to come from the
    /// thread that created the debuggee.
    pub fn run(&self, deadline: Option<Duration>) -> Result<StopEvent, Error> {
        let deadline = deadline.unwrap_or(self.config.default_deadline());

        let mut worker_slot = self.worker.lock().expect("session poisoned");
        if worker_slot.is_some() {
            return Err(Error::InvalidState {
                operation: "run",
                state: self.lock_debugger().context.state(),
            });
        }

        let (entry_tx, entry_rx) = mpsc::channel();
        {
            let mut debugger = self.lock_debugger();
            if debugger.context.state() != DebuggerState::NotStarted {
                return Err(Error::InvalidState {
                    operation: "run",
                    state: debugger.context.state(),
                });
            }
            debugger.set_entry_notifier(entry_tx);
        }

        let command_rx = self
            .command_rx
            .lock()
            .expect("session poisoned")
            .take()
            .expect("command queue consumed only here");

        let (startup_tx, startup_rx) = mpsc::channel();
        let debugger = Arc::clone(&self.debugger);
        let args = self.args.clone();
        let poll = self.config.request_poll();
        let handle = thread::Builder::new()
            .name(format!("wcdbg-worker-{}", self.id))
            .spawn(move || worker_loop(debugger, command_rx, args, startup_tx, poll))?;
        *worker_slot = Some(handle);
        drop(worker_slot);

        match startup_rx.recv_timeout(deadline) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let path = self.lock_debugger().executable().clone();
                return Err(Error::ProcessCreation { path, reason });
            }
            Err(_) => return Err(Error::Timeout("process creation")),
        }

        entry_rx
            .recv_timeout(deadline)
            .map_err(|_| Error::Timeout("initial breakpoint"))?;

        let debugger = self.lock_debugger();
        let modules_loaded = debugger.modules.modules().count();
        Ok(StopEvent::snapshot(&debugger).with_modules_loaded(modules_loaded))
    }

    /// Resume execution and wait for the next stop or exit.
    pub fn resume(&self, deadline: Option<Duration>) -> Result<StopEvent, Error> {
        self.touch();
        {
            let mut debugger = self.lock_debugger();
            if !debugger.context.is_stopped() {
                return Err(Error::InvalidState {
                    operation: "continue",
                    state: debugger.context.state(),
                });
            }
            debugger.context.set_running();
        }
        self.wait_for_stop(deadline, "continue")
    }

    /// Execute one instruction and wait for the step stop.
    pub fn step(&self, deadline: Option<Duration>) -> Result<StopEvent, Error> {
        self.touch();
        {
            let mut debugger = self.lock_debugger();
            if !debugger.context.is_stopped() {
                return Err(Error::InvalidState {
                    operation: "step",
                    state: debugger.context.state(),
                });
            }
            debugger.prepare_step()?;
        }
        self.wait_for_stop(deadline, "step")
    }

    fn wait_for_stop(
        &self,
        deadline: Option<Duration>,
        operation: &'static str,
    ) -> Result<StopEvent, Error> {
        let deadline = deadline.unwrap_or(self.config.default_deadline());
        let started = Instant::now();
        loop {
            {
                let debugger = self.lock_debugger();
                if debugger.context.is_stopped() || debugger.context.is_exited() {
                    return Ok(StopEvent::snapshot(&debugger));
                }
            }
            if started.elapsed() > deadline {
                return Err(Error::Timeout(operation));
            }
            thread::sleep(self.config.request_poll());
        }
    }

    /// Set a breakpoint from a location string.
    ///
    /// While the session is stopped (or not yet running) the engine is driven
    /// directly on the caller's thread: memory writes into a paused process
    /// do not need the worker. While running, the request is marshalled onto
    /// the worker thread.
    pub fn set_breakpoint(&self, location: &str) -> Result<BreakpointView, Error> {
        self.touch();
        // Lock order: worker slot before debugger, same as run().
        let worker_running = self.worker_running();
        {
            let mut guard = self.lock_debugger();
            if guard.context.is_stopped() || !worker_running {
                let debugger = &mut *guard;
                let bp = debugger.breakpoints.set_deferred(
                    &mut debugger.process,
                    &debugger.modules,
                    location,
                )?;
                return Ok(BreakpointView::from(bp));
            }
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(Command::SetBreakpoint {
                location: location.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Command("worker queue closed".to_string()))?;
        reply_rx
            .recv_timeout(self.config.default_deadline())
            .map_err(|_| Error::Timeout("set-breakpoint"))?
            .map_err(Error::Command)
    }

    /// Remove a breakpoint by id, restoring any patched byte.
    pub fn clear_breakpoint(&self, id: u32) -> Result<(), Error> {
        self.touch();
        let worker_running = self.worker_running();
        {
            let mut guard = self.lock_debugger();
            if guard.context.is_stopped() || !worker_running {
                let debugger = &mut *guard;
                return debugger.breakpoints.remove(&mut debugger.process, id);
            }
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(Command::ClearBreakpoint { id, reply: reply_tx })
            .map_err(|_| Error::Command("worker queue closed".to_string()))?;
        reply_rx
            .recv_timeout(self.config.default_deadline())
            .map_err(|_| Error::Timeout("clear-breakpoint"))?
            .map_err(Error::Command)
    }

    pub fn breakpoints(&self) -> Vec<BreakpointView> {
        self.touch();
        self.lock_debugger()
            .breakpoints
            .list()
            .into_iter()
            .map(BreakpointView::from)
            .collect()
    }

    pub fn modules(&self) -> Vec<ModuleView> {
        self.touch();
        self.lock_debugger()
            .modules
            .modules()
            .map(ModuleView::from)
            .collect()
    }

    /// Register snapshot of the current thread; refused unless stopped.
    pub fn registers(&self) -> Result<RegisterFile, Error> {
        self.touch();
        let debugger = self.lock_debugger();
        if !debugger.context.is_stopped() {
            return Err(Error::InvalidState {
                operation: "get-registers",
                state: debugger.context.state(),
            });
        }
        let thread_id = debugger
            .context
            .current_thread_id
            .ok_or(Error::ProcessNotStarted)?;
        debugger.process.registers(thread_id)
    }

    /// Variables visible at the current stop; refused unless stopped.
    pub fn variables(&self) -> Result<Vec<Variable>, Error> {
        self.touch();
        let debugger = self.lock_debugger();
        if !debugger.context.is_stopped() {
            return Err(Error::InvalidState {
                operation: "list-variables",
                state: debugger.context.state(),
            });
        }
        let address = debugger
            .context
            .current_address
            .ok_or(Error::ProcessNotStarted)?;
        let thread_id = debugger
            .context
            .current_thread_id
            .ok_or(Error::ProcessNotStarted)?;

        let module = debugger
            .modules
            .module_for_address(address)
            .ok_or_else(|| Error::ModuleNotFound(address.to_string()))?;
        let debug_info = module
            .debug_info
            .as_ref()
            .ok_or_else(|| Error::NoDebugInformation(module.name.clone()))?;

        let inspector = VariableInspector::new(debug_info, &debugger.process);
        inspector.variables_at(
            address.into_global(module),
            thread_id,
            module.base_address,
        )
    }

    pub fn source(&self, file: &str, line: u64, context: u64) -> Result<SourceExcerpt, Error> {
        self.touch();
        self.source
            .lock()
            .expect("session poisoned")
            .source_lines(file, line, context)
            .ok_or_else(|| Error::SourceNotFound(file.to_string()))
    }

    pub fn state(&self) -> StopEvent {
        StopEvent::snapshot(&self.lock_debugger())
    }

    /// Shut the session down: signal quit, terminate the debuggee, wait for
    /// the worker, then release handles. Handles are released only after the
    /// worker exits; when it overstays the grace period they are left to OS
    /// cleanup rather than risking a close-in-use race.
    pub fn close(&self) {
        info!(target: "session", "closing session {}", self.id);
        {
            let mut guard = self.lock_debugger();
            guard.context.should_quit = true;
            if guard.context.process_id.is_some() && !guard.context.is_exited() {
                let debugger = &mut *guard;
                debugger.breakpoints.clear_all(&mut debugger.process);
                debugger.terminate();
            }
        }

        let handle = self.worker.lock().expect("session poisoned").take();
        if let Some(handle) = handle {
            let grace = self.config.worker_join_grace();
            let started = Instant::now();
            while !handle.is_finished() && started.elapsed() < grace {
                thread::sleep(self.config.request_poll());
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    target: "session",
                    "worker of session {} did not exit within {grace:?}, handles left to OS cleanup",
                    self.id
                );
                return;
            }
        }

        self.lock_debugger().process.release();
    }
}

/// The session worker: creates the debuggee, then pumps debug events until
/// exit. The debugger lock is taken per iteration so request handlers can
/// inspect state between pumps; while the session is stopped the worker
/// sleeps without the lock.
fn worker_loop(
    debugger: Arc<Mutex<Debugger<ProcessController>>>,
    commands: Receiver<Command>,
    args: Vec<String>,
    startup: Sender<Result<(), String>>,
    poll: Duration,
) {
    {
        let mut debugger = debugger.lock().expect("debugger mutex poisoned");
        match debugger.start(&args) {
            Ok(()) => {
                let _ = startup.send(Ok(()));
            }
            Err(e) => {
                error!(target: "session", "debuggee start failed: {e:#}");
                let _ = startup.send(Err(e.to_string()));
                return;
            }
        }
    }

    loop {
        let mut guard = debugger.lock().expect("debugger mutex poisoned");

        while let Ok(command) = commands.try_recv() {
            execute_command(&mut guard, command);
        }

        if guard.context.is_exited() {
            guard.acknowledge_final();
            break;
        }

        if guard.context.is_stopped() && !guard.context.should_quit {
            drop(guard);
            thread::sleep(poll);
            continue;
        }

        if let Err(e) = guard.pump_once() {
            error!(target: "session", "event pump failed: {e:#}");
            guard.terminate();
            guard.context.set_exited(1);
            guard.acknowledge_final();
            break;
        }
    }

    info!(target: "session", "worker exited");
}

fn execute_command(debugger: &mut Debugger<ProcessController>, command: Command) {
    match command {
        Command::SetBreakpoint { location, reply } => {
            let debugger = &mut *debugger;
            let result = debugger
                .breakpoints
                .set_deferred(&mut debugger.process, &debugger.modules, &location)
                .map(BreakpointView::from)
                .map_err(|e| e.to_string());
            let _ = reply.send(result);
        }
        Command::ClearBreakpoint { id, reply } => {
            let debugger = &mut *debugger;
            let result = debugger
                .breakpoints
                .remove(&mut debugger.process, id)
                .map_err(|e| e.to_string());
            let _ = reply.send(result);
        }
    }
}

/// Registry of live sessions, keyed by id. Sessions are independent; the
/// registry only adds lifetime management.
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn create_session(
        &self,
        executable: PathBuf,
        args: Vec<String>,
        source_dirs: Vec<PathBuf>,
    ) -> Result<Arc<Session>, Error> {
        let session = Arc::new(Session::new(
            self.config.clone(),
            executable,
            args,
            source_dirs,
        )?);
        info!(target: "session", "session {} created", session.id());
        self.sessions
            .lock()
            .expect("registry poisoned")
            .insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get_session(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .lock()
            .expect("registry poisoned")
            .get(&id)
            .cloned()?;
        session.touch();
        Some(session)
    }

    pub fn close_session(&self, id: Uuid) -> Result<(), Error> {
        let session = self
            .sessions
            .lock()
            .expect("registry poisoned")
            .remove(&id)
            .ok_or(Error::SessionNotFound)?;
        session.close();
        Ok(())
    }

    /// Close sessions idle longer than the configured timeout.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().expect("registry poisoned");
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > self.config.session_timeout())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.close();
        }
        expired.len()
    }

    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("registry poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("registry poisoned").len()
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .keys()
            .copied()
            .collect()
    }
}
