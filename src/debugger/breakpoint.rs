use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::module::ModuleManager;
use crate::debugger::process::ProcessAccess;
use crate::debugger::register::{Register, TRAP_FLAG};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use strum_macros::Display;

/// The int3 opcode written over the first instruction byte.
pub const INT3: u8 = 0xCC;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BreakpointStatus {
    Active,
    Pending,
}

/// A parsed breakpoint location string.
///
/// ```text
/// location := hex_addr | module_offset | source_line
/// hex_addr := '0x' HEX+
/// module_offset := MODULE_NAME ':' ('0x')? HEX+     (module ends in .dll/.exe)
/// source_line := FILE_NAME ':' DECIMAL+
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BreakpointLocation {
    Address(RelocatedAddress),
    ModuleOffset { module: String, offset: u32 },
    Line { file: String, line: u64 },
}

static HEX_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0[xX][0-9a-fA-F]+$").expect("valid regex"));
static MODULE_OFFSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<module>[^:]+\.(dll|exe)):(0[xX])?(?P<offset>[0-9a-fA-F]+)$")
        .expect("valid regex")
});
static SOURCE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<file>[^:]+(:[\\/][^:]*)?):(?P<line>[0-9]+)$").expect("valid regex"));

impl BreakpointLocation {
    pub fn parse(location: &str) -> Result<Self, Error> {
        let location = location.trim();

        if HEX_ADDR.is_match(location) {
            let addr = u32::from_str_radix(&location[2..], 16)
                .map_err(|_| Error::InvalidLocation(location.to_string()))?;
            return Ok(BreakpointLocation::Address(addr.into()));
        }

        if let Some(captures) = MODULE_OFFSET.captures(location) {
            let offset = u32::from_str_radix(&captures["offset"], 16)
                .map_err(|_| Error::InvalidLocation(location.to_string()))?;
            return Ok(BreakpointLocation::ModuleOffset {
                module: captures["module"].to_string(),
                offset,
            });
        }

        if let Some(captures) = SOURCE_LINE.captures(location) {
            let line = captures["line"]
                .parse()
                .map_err(|_| Error::InvalidLocation(location.to_string()))?;
            return Ok(BreakpointLocation::Line {
                file: captures["file"].to_string(),
                line,
            });
        }

        Err(Error::InvalidLocation(location.to_string()))
    }
}

/// Breakpoint representation: an int3 patch over one instruction byte, or a
/// pending request waiting for its code container to be mapped.
#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub id: u32,
    pub status: BreakpointStatus,
    pub enabled: bool,
    /// Absolute address; meaningful only while active.
    pub address: Option<RelocatedAddress>,
    /// Original byte replaced by [`INT3`]; meaningful only while active.
    pub saved_byte: Option<u8>,
    pub hit_count: u32,
    pub temporary: bool,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub module_name: Option<String>,
    /// Image-relative offset for the `module:offset` form.
    pub offset: Option<u32>,
    /// The location string as given, for pending display.
    pub pending_location: Option<String>,
}

impl Breakpoint {
    fn new(id: u32) -> Self {
        Self {
            id,
            status: BreakpointStatus::Active,
            enabled: false,
            address: None,
            saved_byte: None,
            hit_count: 0,
            temporary: false,
            file: None,
            line: None,
            module_name: None,
            offset: None,
            pending_location: None,
        }
    }
}

/// The software breakpoint engine.
///
/// Active breakpoints are keyed by absolute address, pending ones wait in a
/// list until a module-load event resolves them. The engine does not own the
/// process or the module manager; callers pass them per operation.
#[derive(Default)]
pub struct BreakpointEngine {
    active: HashMap<RelocatedAddress, Breakpoint>,
    pending: Vec<Breakpoint>,
    next_id: u32,
    /// Address of the breakpoint whose byte is currently restored and must be
    /// re-armed on the next single-step exception.
    rearm_address: Option<RelocatedAddress>,
}

impl BreakpointEngine {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            pending: vec![],
            next_id: 1,
            rearm_address: None,
        }
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Patch `INT3` over the byte at `addr`, returning the saved original.
    /// The write is read back and verified.
    fn install<P: ProcessAccess>(
        process: &mut P,
        addr: RelocatedAddress,
    ) -> Result<u8, Error> {
        let saved = process.read_byte(addr)?;
        process.write_memory(addr, &[INT3])?;
        let read_back = process.read_byte(addr)?;
        if read_back != INT3 {
            return Err(Error::BreakpointVerification { addr, read_back });
        }
        Ok(saved)
    }

    /// Set an active breakpoint at an absolute address.
    pub fn set_at_address<P: ProcessAccess>(
        &mut self,
        process: &mut P,
        modules: &ModuleManager,
        addr: RelocatedAddress,
    ) -> Result<&Breakpoint, Error> {
        if self.active.contains_key(&addr) {
            return Err(Error::BreakpointDuplicate(addr));
        }

        let saved = Self::install(process, addr)?;

        let mut bp = Breakpoint::new(self.take_id());
        bp.status = BreakpointStatus::Active;
        bp.enabled = true;
        bp.address = Some(addr);
        bp.saved_byte = Some(saved);

        // Resolve the source place for display.
        if let Some((module, place)) = modules.resolve_address(addr) {
            bp.module_name = Some(module.name.clone());
            bp.file = Some(place.file.to_string_lossy().into_owned());
            bp.line = Some(place.line);
        } else if let Some(module) = modules.module_for_address(addr) {
            bp.module_name = Some(module.name.clone());
        }

        info!(target: "debugger", "breakpoint {} set at {addr}", bp.id);
        Ok(self.active.entry(addr).or_insert(bp))
    }

    /// Set a breakpoint from a location string; may produce a pending entry
    /// when the target container is not mapped yet.
    pub fn set_deferred<P: ProcessAccess>(
        &mut self,
        process: &mut P,
        modules: &ModuleManager,
        location: &str,
    ) -> Result<&Breakpoint, Error> {
        match BreakpointLocation::parse(location)? {
            // A raw address is never deferred.
            BreakpointLocation::Address(addr) => self.set_at_address(process, modules, addr),

            BreakpointLocation::ModuleOffset { module, offset } => {
                let duplicate = self.pending.iter().any(|bp| {
                    bp.module_name
                        .as_deref()
                        .map(|m| m.eq_ignore_ascii_case(&module))
                        .unwrap_or(false)
                        && bp.offset == Some(offset)
                });
                if duplicate {
                    return Err(Error::BreakpointPendingDuplicate(location.to_string()));
                }

                if let Some(loaded) = modules.module_by_name(&module) {
                    // Offsets in this form are image-relative by convention:
                    // no code section offset is added.
                    let addr = RelocatedAddress::from(loaded.base_address.wrapping_add(offset));
                    let name = loaded.name.clone();
                    let bp_addr = {
                        let bp = self.set_at_address(process, modules, addr)?;
                        bp.address.expect("active breakpoint has address")
                    };
                    let bp = self.active.get_mut(&bp_addr).expect("just inserted");
                    bp.module_name = Some(name);
                    bp.offset = Some(offset);
                    return Ok(bp);
                }

                debug!(target: "debugger", "module not loaded for {location}, breakpoint pending");
                let mut bp = Breakpoint::new(self.take_id());
                bp.status = BreakpointStatus::Pending;
                bp.module_name = Some(module);
                bp.offset = Some(offset);
                bp.pending_location = Some(location.to_string());
                self.pending.push(bp);
                Ok(self.pending.last().expect("just pushed"))
            }

            BreakpointLocation::Line { file, line } => {
                let duplicate = self
                    .pending
                    .iter()
                    .any(|bp| bp.file.as_deref() == Some(file.as_str()) && bp.line == Some(line));
                if duplicate {
                    return Err(Error::BreakpointPendingDuplicate(location.to_string()));
                }

                if let Some((addr, module)) = modules.resolve_line(&file, line) {
                    let name = module.name.clone();
                    let bp_addr = {
                        let bp = self.set_at_address(process, modules, addr)?;
                        bp.address.expect("active breakpoint has address")
                    };
                    let bp = self.active.get_mut(&bp_addr).expect("just inserted");
                    bp.file = Some(file);
                    bp.line = Some(line);
                    bp.module_name = Some(name);
                    return Ok(bp);
                }

                debug!(target: "debugger", "no resolution for {location} yet, breakpoint pending");
                let mut bp = Breakpoint::new(self.take_id());
                bp.status = BreakpointStatus::Pending;
                bp.file = Some(file);
                bp.line = Some(line);
                bp.pending_location = Some(location.to_string());
                self.pending.push(bp);
                Ok(self.pending.last().expect("just pushed"))
            }
        }
    }

    /// Try to resolve pending breakpoints against a freshly loaded module.
    /// Entries that fail to install stay pending for a later load.
    pub fn resolve_pending_for_module<P: ProcessAccess>(
        &mut self,
        process: &mut P,
        modules: &ModuleManager,
        module_name: &str,
    ) -> Vec<u32> {
        if self.pending.is_empty() {
            return vec![];
        }

        let mut resolved = vec![];
        let mut remaining = vec![];

        for mut bp in std::mem::take(&mut self.pending) {
            let address = match Self::pending_target(&bp, modules, module_name) {
                Some(address) => address,
                None => {
                    remaining.push(bp);
                    continue;
                }
            };

            if self.active.contains_key(&address) {
                debug!(target: "debugger", "breakpoint already active at {address}, pending entry {} dropped", bp.id);
                resolved.push(bp.id);
                continue;
            }

            match Self::install(process, address) {
                Ok(saved) => {
                    bp.address = Some(address);
                    bp.saved_byte = Some(saved);
                    bp.enabled = true;
                    bp.status = BreakpointStatus::Active;
                    if bp.module_name.is_none() {
                        bp.module_name = modules
                            .module_for_address(address)
                            .map(|m| m.name.clone());
                    }
                    info!(target: "debugger", "pending breakpoint {} activated at {address}", bp.id);
                    resolved.push(bp.id);
                    self.active.insert(address, bp);
                }
                Err(e) => {
                    debug!(target: "debugger", "pending breakpoint {} install failed: {e:#}", bp.id);
                    remaining.push(bp);
                }
            }
        }

        self.pending = remaining;
        resolved
    }

    /// Compute the absolute target of a pending entry against the loading
    /// module, or `None` when the entry does not belong to it.
    fn pending_target(
        bp: &Breakpoint,
        modules: &ModuleManager,
        module_name: &str,
    ) -> Option<RelocatedAddress> {
        if let (Some(name), Some(offset)) = (&bp.module_name, bp.offset) {
            if !name.eq_ignore_ascii_case(module_name) {
                return None;
            }
            let module = modules.module_by_name(module_name)?;
            return Some(RelocatedAddress::from(
                module.base_address.wrapping_add(offset),
            ));
        }

        if let (Some(file), Some(line)) = (&bp.file, bp.line) {
            let (address, module) = modules.resolve_line(file, line)?;
            // Accept only when the resolution landed inside the loading module.
            if !module.name.eq_ignore_ascii_case(module_name) {
                return None;
            }
            return Some(address);
        }

        None
    }

    /// Move active breakpoints of an unloading module back to the pending
    /// list. Their patch bytes vanished with the mapping, so only bookkeeping
    /// is reset.
    pub fn unpend_for_module(&mut self, module_name: &str) -> usize {
        let unpend_addrs: Vec<RelocatedAddress> = self
            .active
            .iter()
            .filter(|(_, bp)| {
                bp.module_name
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(module_name))
                    .unwrap_or(false)
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &unpend_addrs {
            let mut bp = self.active.remove(addr).expect("address collected above");
            if self.rearm_address == Some(*addr) {
                self.rearm_address = None;
            }
            bp.address = None;
            bp.saved_byte = None;
            bp.enabled = false;
            bp.status = BreakpointStatus::Pending;
            if bp.pending_location.is_none() {
                bp.pending_location = match (&bp.file, bp.line, &bp.module_name, bp.offset) {
                    (Some(file), Some(line), _, _) => Some(format!("{file}:{line}")),
                    (_, _, Some(module), Some(offset)) => Some(format!("{module}:{offset:#x}")),
                    _ => None,
                };
            }
            info!(target: "debugger", "breakpoint {} moved back to pending", bp.id);
            self.pending.push(bp);
        }

        unpend_addrs.len()
    }

    /// Handle a breakpoint exception at `addr`.
    ///
    /// The OS has advanced the instruction pointer past the int3 byte. The
    /// engine restores the original byte, rewinds the instruction pointer so
    /// the real instruction re-executes, and sets the trap flag so the next
    /// single-step exception re-arms the patch.
    ///
    /// Returns the hit breakpoint, or `None` when the address is not ours.
    pub fn on_hit<P: ProcessAccess>(
        &mut self,
        process: &mut P,
        addr: RelocatedAddress,
        thread_id: u32,
    ) -> Result<Option<Breakpoint>, Error> {
        if !self.active.contains_key(&addr) {
            return Ok(None);
        }

        let (saved, temporary) = {
            let bp = self.active.get_mut(&addr).expect("checked above");
            bp.hit_count += 1;
            (bp.saved_byte.unwrap_or(INT3), bp.temporary)
        };

        process.write_memory(addr, &[saved])?;
        process.set_register(thread_id, Register::Eip, addr.as_u32())?;

        let eflags = process.register(thread_id, Register::Eflags)?;
        process.set_register(thread_id, Register::Eflags, eflags | TRAP_FLAG)?;

        let bp = if temporary {
            self.active.remove(&addr).expect("checked above")
        } else {
            let bp = self.active.get_mut(&addr).expect("checked above");
            // Bytes are the originals until the re-arm single-step fires.
            bp.enabled = false;
            self.rearm_address = Some(addr);
            bp.clone()
        };

        Ok(Some(bp))
    }

    /// Re-arm the last-hit breakpoint on its single-step exception.
    /// Returns `false` when no re-arm was pending.
    pub fn rearm_after_step<P: ProcessAccess>(
        &mut self,
        process: &mut P,
        thread_id: u32,
    ) -> Result<bool, Error> {
        let Some(addr) = self.rearm_address.take() else {
            return Ok(false);
        };

        if let Some(bp) = self.active.get_mut(&addr) {
            process.write_memory(addr, &[INT3])?;
            bp.enabled = true;
            debug!(target: "debugger", "breakpoint {} re-armed at {addr}", bp.id);
        }

        let eflags = process.register(thread_id, Register::Eflags)?;
        process.set_register(thread_id, Register::Eflags, eflags & !TRAP_FLAG)?;

        Ok(true)
    }

    /// Remove a breakpoint by id, restoring the patched byte when active.
    pub fn remove<P: ProcessAccess>(&mut self, process: &mut P, id: u32) -> Result<(), Error> {
        if let Some(addr) = self
            .active
            .iter()
            .find(|(_, bp)| bp.id == id)
            .map(|(addr, _)| *addr)
        {
            let bp = self.active.remove(&addr).expect("address found above");
            if bp.enabled {
                if let Some(saved) = bp.saved_byte {
                    process.write_memory(addr, &[saved])?;
                }
            }
            if self.rearm_address == Some(addr) {
                self.rearm_address = None;
            }
            return Ok(());
        }

        if let Some(idx) = self.pending.iter().position(|bp| bp.id == id) {
            self.pending.remove(idx);
            return Ok(());
        }

        Err(Error::BreakpointNotFound(id))
    }

    /// Restore every patched byte and forget all breakpoints.
    pub fn clear_all<P: ProcessAccess>(&mut self, process: &mut P) {
        for (addr, bp) in self.active.drain() {
            if bp.enabled {
                if let Some(saved) = bp.saved_byte {
                    let _ = process.write_memory(addr, &[saved]);
                }
            }
        }
        self.pending.clear();
        self.rearm_address = None;
    }

    pub fn breakpoint_at(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.active.get(&addr)
    }

    pub fn is_known_address(&self, addr: RelocatedAddress) -> bool {
        self.active.contains_key(&addr)
    }

    /// All breakpoints, active and pending, ordered by id.
    pub fn list(&self) -> Vec<&Breakpoint> {
        let mut all: Vec<&Breakpoint> = self.active.values().chain(self.pending.iter()).collect();
        all.sort_by_key(|bp| bp.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::mock::FakeProcess;
    use crate::debugger::module::ModuleManager;

    fn empty_modules() -> ModuleManager {
        ModuleManager::new()
    }

    #[test]
    fn test_location_grammar() {
        assert_eq!(
            BreakpointLocation::parse("0x001d3966").unwrap(),
            BreakpointLocation::Address(0x001d_3966.into())
        );
        assert_eq!(
            BreakpointLocation::parse("smackw32.dll:0x3966").unwrap(),
            BreakpointLocation::ModuleOffset {
                module: "smackw32.dll".to_string(),
                offset: 0x3966
            }
        );
        assert_eq!(
            BreakpointLocation::parse("SMACKW32.DLL:3966").unwrap(),
            BreakpointLocation::ModuleOffset {
                module: "SMACKW32.DLL".to_string(),
                offset: 0x3966
            }
        );
        assert_eq!(
            BreakpointLocation::parse("testdll.c:7").unwrap(),
            BreakpointLocation::Line {
                file: "testdll.c".to_string(),
                line: 7
            }
        );
        assert!(BreakpointLocation::parse("testdll.c").is_err());
        assert!(BreakpointLocation::parse("testdll.c:xx").is_err());
        assert!(BreakpointLocation::parse("0xzz").is_err());
    }

    #[test]
    fn test_set_at_address_patches_and_verifies() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55, 0x8b, 0xec]);
        let mut engine = BreakpointEngine::new();

        let bp = engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();
        assert_eq!(bp.id, 1);
        assert_eq!(bp.saved_byte, Some(0x55));
        assert!(bp.enabled);
        assert_eq!(process.byte_at(0x401000), INT3);

        // Invariant: enabled-active implies 0xCC in memory and saved != 0xCC.
        for bp in engine.list() {
            if bp.status == BreakpointStatus::Active && bp.enabled {
                assert_eq!(process.byte_at(bp.address.unwrap().as_u32()), INT3);
                assert_ne!(bp.saved_byte.unwrap(), INT3);
            }
        }
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        let mut engine = BreakpointEngine::new();
        engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();
        let err = engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap_err();
        assert!(matches!(err, Error::BreakpointDuplicate(_)));
    }

    #[test]
    fn test_unmapped_module_offset_goes_pending() {
        let mut process = FakeProcess::new();
        let mut engine = BreakpointEngine::new();

        let bp = engine
            .set_deferred(&mut process, &empty_modules(), "testdll.dll:0x100")
            .unwrap();
        assert_eq!(bp.status, BreakpointStatus::Pending);
        assert_eq!(bp.offset, Some(0x100));
        assert_eq!(bp.module_name.as_deref(), Some("testdll.dll"));

        let err = engine
            .set_deferred(&mut process, &empty_modules(), "TESTDLL.DLL:0x100")
            .unwrap_err();
        assert!(matches!(err, Error::BreakpointPendingDuplicate(_)));
    }

    #[test]
    fn test_pending_resolves_on_module_load_without_section_offset() {
        let mut process = FakeProcess::new();
        let mut engine = BreakpointEngine::new();
        engine
            .set_deferred(&mut process, &empty_modules(), "testdll.dll:0x100")
            .unwrap();

        let mut modules = ModuleManager::new();
        modules.on_module_loaded(
            "testdll.dll".to_string(),
            0x1000_0000,
            std::path::PathBuf::new(),
            0,
        );
        // Image-relative convention: base + offset, no section offset.
        process.map_bytes(0x1000_0100, &[0x8b]);

        let resolved = engine.resolve_pending_for_module(&mut process, &modules, "testdll.dll");
        assert_eq!(resolved.len(), 1);
        let bp = engine.breakpoint_at(0x1000_0100.into()).unwrap();
        assert_eq!(bp.status, BreakpointStatus::Active);
        assert_eq!(bp.saved_byte, Some(0x8b));
        assert_eq!(process.byte_at(0x1000_0100), INT3);
    }

    #[test]
    fn test_pending_survives_failed_install() {
        let mut process = FakeProcess::new();
        let mut engine = BreakpointEngine::new();
        engine
            .set_deferred(&mut process, &empty_modules(), "testdll.dll:0x100")
            .unwrap();

        let mut modules = ModuleManager::new();
        modules.on_module_loaded(
            "testdll.dll".to_string(),
            0x1000_0000,
            std::path::PathBuf::new(),
            0,
        );
        // Target byte not mapped: install fails, entry must stay pending.
        let resolved = engine.resolve_pending_for_module(&mut process, &modules, "testdll.dll");
        assert!(resolved.is_empty());
        assert_eq!(engine.list().len(), 1);
        assert_eq!(engine.list()[0].status, BreakpointStatus::Pending);
    }

    #[test]
    fn test_hit_restores_byte_rewinds_eip_and_sets_trap_flag() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        // The OS reports the exception at the patch address with EIP past it.
        process.set_register(7, Register::Eip, 0x401001);
        process.set_register(7, Register::Eflags, 0x202);

        let mut engine = BreakpointEngine::new();
        engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();

        let bp = engine
            .on_hit(&mut process, 0x401000.into(), 7)
            .unwrap()
            .unwrap();
        assert_eq!(bp.hit_count, 1);
        assert_eq!(process.byte_at(0x401000), 0x55, "original byte restored");
        assert_eq!(process.register(7, Register::Eip).unwrap(), 0x401000);
        assert_ne!(process.register(7, Register::Eflags).unwrap() & TRAP_FLAG, 0);
        assert!(!engine.breakpoint_at(0x401000.into()).unwrap().enabled);
    }

    #[test]
    fn test_rearm_after_step_restores_patch_and_clears_trap_flag() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        process.set_register(7, Register::Eip, 0x401001);
        process.set_register(7, Register::Eflags, 0x202);

        let mut engine = BreakpointEngine::new();
        engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();
        engine.on_hit(&mut process, 0x401000.into(), 7).unwrap();

        assert!(engine.rearm_after_step(&mut process, 7).unwrap());
        assert_eq!(process.byte_at(0x401000), INT3);
        assert!(engine.breakpoint_at(0x401000.into()).unwrap().enabled);
        assert_eq!(process.register(7, Register::Eflags).unwrap() & TRAP_FLAG, 0);

        // Nothing left to re-arm.
        assert!(!engine.rearm_after_step(&mut process, 7).unwrap());
    }

    #[test]
    fn test_hit_rearm_across_reentry_increments_hit_count() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        process.set_register(7, Register::Eflags, 0x202);

        let mut engine = BreakpointEngine::new();
        engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();

        let first = engine
            .on_hit(&mut process, 0x401000.into(), 7)
            .unwrap()
            .unwrap();
        engine.rearm_after_step(&mut process, 7).unwrap();
        let second = engine
            .on_hit(&mut process, 0x401000.into(), 7)
            .unwrap()
            .unwrap();

        assert_eq!(first.address, second.address);
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);
    }

    #[test]
    fn test_temporary_breakpoint_removed_on_hit() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        process.set_register(7, Register::Eflags, 0);

        let mut engine = BreakpointEngine::new();
        engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap();
        engine
            .active
            .get_mut(&RelocatedAddress::from(0x401000))
            .unwrap()
            .temporary = true;

        engine.on_hit(&mut process, 0x401000.into(), 7).unwrap();
        assert!(engine.breakpoint_at(0x401000.into()).is_none());
    }

    #[test]
    fn test_unknown_address_is_not_ours() {
        let mut process = FakeProcess::new();
        let mut engine = BreakpointEngine::new();
        assert!(engine
            .on_hit(&mut process, 0xdead_0000.into(), 7)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unpend_on_module_unload() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x1000_0100, &[0x8b]);

        let mut modules = ModuleManager::new();
        modules.on_module_loaded(
            "testdll.dll".to_string(),
            0x1000_0000,
            std::path::PathBuf::new(),
            0,
        );

        let mut engine = BreakpointEngine::new();
        engine
            .set_deferred(&mut process, &modules, "testdll.dll:0x100")
            .unwrap();
        assert_eq!(engine.list()[0].status, BreakpointStatus::Active);

        let moved = engine.unpend_for_module("TESTDLL.DLL");
        assert_eq!(moved, 1);
        let bp = engine.list()[0];
        assert_eq!(bp.status, BreakpointStatus::Pending);
        assert_eq!(bp.address, None);
        assert_eq!(bp.saved_byte, None);
        assert!(!bp.enabled);
    }

    #[test]
    fn test_remove_restores_original_byte() {
        let mut process = FakeProcess::new();
        process.map_bytes(0x401000, &[0x55]);
        let mut engine = BreakpointEngine::new();
        let id = engine
            .set_at_address(&mut process, &empty_modules(), 0x401000.into())
            .unwrap()
            .id;

        engine.remove(&mut process, id).unwrap();
        assert_eq!(process.byte_at(0x401000), 0x55);
        assert!(engine.list().is_empty());
        assert!(matches!(
            engine.remove(&mut process, id),
            Err(Error::BreakpointNotFound(_))
        ));
    }
}
