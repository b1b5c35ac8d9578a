//! Result records handed to the transport layer.
//!
//! These are plain serializable views over the debugger state; the wire
//! encoding is the transport's concern.

use crate::debugger::breakpoint::{Breakpoint, BreakpointStatus};
use crate::debugger::module::Module;
use crate::debugger::process::ProcessAccess;
use crate::debugger::state::{DebuggerState, StopReason};
use crate::debugger::Debugger;
use serde::Serialize;

pub use crate::debugger::register::RegisterFile;
pub use crate::dwarf::variable::{Variable, VariableLocation};

#[derive(Clone, Debug, Serialize)]
pub struct SourcePlace {
    pub file: String,
    pub line: u64,
}

/// What a run/continue/step request returns.
#[derive(Clone, Debug, Serialize)]
pub struct StopEvent {
    pub state: DebuggerState,
    pub reason: Option<StopReason>,
    pub address: Option<String>,
    pub thread_id: Option<u32>,
    pub module_name: Option<String>,
    pub exception_code: Option<String>,
    pub source: Option<SourcePlace>,
    pub exit_code: Option<u32>,
    /// Filled by the run request: modules mapped at the entry stop.
    pub modules_loaded: Option<usize>,
}

impl StopEvent {
    pub fn snapshot<P: ProcessAccess>(debugger: &Debugger<P>) -> Self {
        let context = &debugger.context;
        let stop = context.stop_info();

        let address = stop.and_then(|s| s.address);
        let source = address
            .and_then(|addr| debugger.modules.resolve_address(addr))
            .map(|(_, place)| SourcePlace {
                file: place.file.to_string_lossy().into_owned(),
                line: place.line,
            });

        StopEvent {
            state: context.state(),
            reason: stop.map(|s| s.reason),
            address: address.map(|a| a.to_string()),
            thread_id: stop.and_then(|s| s.thread_id),
            module_name: stop.and_then(|s| s.module_name.clone()),
            exception_code: stop
                .filter(|s| s.reason == StopReason::Exception)
                .and_then(|s| s.exception_code)
                .map(|code| format!("{code:#010x}")),
            source,
            exit_code: context.exit_code(),
            modules_loaded: None,
        }
    }

    pub fn with_modules_loaded(mut self, count: usize) -> Self {
        self.modules_loaded = Some(count);
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakpointView {
    pub id: u32,
    pub status: BreakpointStatus,
    pub enabled: bool,
    pub address: Option<String>,
    pub hit_count: u32,
    pub location: Option<String>,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub module_name: Option<String>,
}

impl From<&Breakpoint> for BreakpointView {
    fn from(bp: &Breakpoint) -> Self {
        let location = match bp.status {
            BreakpointStatus::Pending => bp.pending_location.clone(),
            BreakpointStatus::Active => match (&bp.file, bp.line) {
                (Some(file), Some(line)) => {
                    let basename = std::path::Path::new(file)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file.clone());
                    Some(format!("{basename}:{line}"))
                }
                _ => bp.address.map(|a| a.to_string()),
            },
        };
        BreakpointView {
            id: bp.id,
            status: bp.status,
            enabled: bp.enabled,
            address: bp.address.map(|a| a.to_string()),
            hit_count: bp.hit_count,
            location,
            file: bp.file.clone(),
            line: bp.line,
            module_name: bp.module_name.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModuleView {
    pub name: String,
    pub base_address: String,
    pub path: String,
    pub has_debug_info: bool,
    pub code_section_offset: String,
}

impl From<&Module> for ModuleView {
    fn from(module: &Module) -> Self {
        ModuleView {
            name: module.name.clone(),
            base_address: format!("{:#010x}", module.base_address),
            path: module.path.to_string_lossy().into_owned(),
            has_debug_info: module.has_debug_info(),
            code_section_offset: format!("{:#x}", module.code_section_offset),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceLine {
    pub line_number: u64,
    pub content: String,
    pub is_current: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceExcerpt {
    pub file: String,
    pub full_path: String,
    pub lines: Vec<SourceLine>,
}
