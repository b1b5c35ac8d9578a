use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::dwarf::line::SourceLocation;
use crate::dwarf::DebugInformation;
use crate::weak_error;
use log::{debug, info, warn};
use object::read::pe::PeFile32;
use object::LittleEndian;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// A loaded code container (the main EXE or a DLL).
pub struct Module {
    /// Basename of the on-disk file, e.g. `smackw32.dll`.
    pub name: String,
    pub base_address: u32,
    pub path: PathBuf,
    /// In-memory size; 0 when the load event did not carry one.
    pub size: u32,
    /// Virtual address at which the executable section starts.
    /// DWARF addresses are relative to this section, not to the image base.
    pub code_section_offset: u32,
    pub debug_info: Option<DebugInformation>,
}

impl Module {
    pub fn has_debug_info(&self) -> bool {
        self.debug_info.is_some()
    }

    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        let addr = addr.as_u32();
        if self.size > 0 {
            addr >= self.base_address && addr < self.base_address + self.size
        } else {
            addr >= self.base_address
        }
    }
}

/// Tracks loaded modules and their debug information.
///
/// The main EXE often has no debug info while a DLL does, so every address
/// resolution is a two-step: find the owning module, then query its DWARF
/// state with a section-relative address.
#[derive(Default)]
pub struct ModuleManager {
    modules: BTreeMap<u32, Module>,
    by_name: HashMap<String, u32>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a module on a create-process or load-dll event and try to load
    /// its debug information from disk.
    pub fn on_module_loaded(&mut self, name: String, base_address: u32, path: PathBuf, size: u32) {
        info!(target: "debugger", "module loaded: {name} at {base_address:#010x}");

        let mut module = Module {
            name: name.clone(),
            base_address,
            path,
            size,
            code_section_offset: 0,
            debug_info: None,
        };
        self.load_debug_info(&mut module);

        self.by_name.insert(name.to_lowercase(), base_address);
        self.modules.insert(base_address, module);
    }

    /// Drop a module on an unload-dll event, returning it so the caller can
    /// unpend its breakpoints.
    pub fn on_module_unloaded(&mut self, base_address: u32) -> Option<Module> {
        match self.modules.remove(&base_address) {
            Some(module) => {
                info!(target: "debugger", "module unloaded: {} from {base_address:#010x}", module.name);
                self.by_name.remove(&module.name.to_lowercase());
                Some(module)
            }
            None => {
                warn!(target: "debugger", "unload of unknown module at {base_address:#010x}");
                None
            }
        }
    }

    fn load_debug_info(&self, module: &mut Module) {
        if module.path.as_os_str().is_empty() || !module.path.exists() {
            debug!(target: "debugger", "{}: no on-disk file, debug info skipped", module.name);
            return;
        }

        module.code_section_offset =
            weak_error!(code_section_offset(&module.path)).unwrap_or_default();
        if module.code_section_offset != 0 {
            debug!(
                target: "debugger",
                "{}: code section offset {:#x}",
                module.name,
                module.code_section_offset
            );
        }

        match DebugInformation::load(&module.path) {
            Ok(Some(debug_info)) => module.debug_info = Some(debug_info),
            Ok(None) => debug!(target: "debugger", "{}: no debug info", module.name),
            Err(e) => warn!(target: "debugger", "{}: debug info load failed: {e:#}", module.name),
        }
    }

    /// Find which module owns an absolute address: containment when the size
    /// is known, otherwise the module with the greatest base at or below the
    /// address.
    pub fn module_for_address(&self, addr: RelocatedAddress) -> Option<&Module> {
        let (_, module) = self.modules.range(..=addr.as_u32()).next_back()?;
        module.contains(addr).then_some(module)
    }

    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        let base = self.by_name.get(&name.to_lowercase())?;
        self.modules.get(base)
    }

    /// Resolve an absolute address to a source place.
    pub fn resolve_address(
        &self,
        addr: RelocatedAddress,
    ) -> Option<(&Module, &SourceLocation)> {
        let module = self.module_for_address(addr)?;
        let debug_info = module.debug_info.as_ref()?;
        let place = debug_info.find_place(addr.into_global(module))?;
        Some((module, place))
    }

    /// Resolve a source place to an absolute address, searching every module
    /// with debug information. The first module that resolves wins.
    ///
    /// DWARF line addresses are section-relative, so the result is
    /// `base + code_section_offset + row_address`.
    pub fn resolve_line(&self, file: &str, line: u64) -> Option<(RelocatedAddress, &Module)> {
        for module in self.modules.values() {
            let Some(debug_info) = module.debug_info.as_ref() else {
                continue;
            };
            if let Some(global) = debug_info.find_line_address(file, line) {
                return Some((global.relocate(module), module));
            }
        }
        None
    }

    /// All modules ordered by base address.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn modules_with_debug_info(&self) -> impl Iterator<Item = &Module> {
        self.modules.values().filter(|m| m.has_debug_info())
    }

    pub fn source_files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self
            .modules_with_debug_info()
            .flat_map(|m| {
                m.debug_info
                    .as_ref()
                    .expect("filtered on debug info")
                    .files()
            })
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Virtual address of the first executable section of a PE image.
///
/// Watcom emits its code into a section classed `AUTO`, typically mapped at
/// virtual address 0x1000.
pub fn code_section_offset(path: &Path) -> Result<u32, Error> {
    let data = fs::read(path)?;
    let pe = PeFile32::parse(&*data)?;

    for section in pe.section_table().iter() {
        let name = String::from_utf8_lossy(&section.name);
        let name = name.trim_end_matches('\0');
        let characteristics = section.characteristics.get(LittleEndian);
        if name == "AUTO" || characteristics & object::pe::IMAGE_SCN_MEM_EXECUTE != 0 {
            return Ok(section.virtual_address.get(LittleEndian));
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::address::GlobalAddress;

    fn module(name: &str, base: u32, size: u32, section_offset: u32) -> Module {
        Module {
            name: name.to_string(),
            base_address: base,
            path: PathBuf::new(),
            size,
            code_section_offset: section_offset,
            debug_info: None,
        }
    }

    fn manager_with(modules: Vec<Module>) -> ModuleManager {
        let mut manager = ModuleManager::new();
        for m in modules {
            manager.by_name.insert(m.name.to_lowercase(), m.base_address);
            manager.modules.insert(m.base_address, m);
        }
        manager
    }

    #[test]
    fn test_module_for_address_prefers_greatest_lower_base() {
        let manager = manager_with(vec![
            module("plague.exe", 0x0040_0000, 0, 0x1000),
            module("smackw32.dll", 0x001d_0000, 0, 0x1000),
        ]);

        let m = manager.module_for_address(0x001d_3966.into()).unwrap();
        assert_eq!(m.name, "smackw32.dll");
        let m = manager.module_for_address(0x0045_0000.into()).unwrap();
        assert_eq!(m.name, "plague.exe");
        assert!(manager.module_for_address(0x0010_0000.into()).is_none());
    }

    #[test]
    fn test_module_for_address_respects_known_size() {
        let manager = manager_with(vec![module("testdll.dll", 0x1000_0000, 0x2000, 0x1000)]);
        assert!(manager.module_for_address(0x1000_1fff.into()).is_some());
        assert!(manager.module_for_address(0x1000_2000.into()).is_none());
    }

    #[test]
    fn test_section_offset_address_math() {
        // DLL at 0x001d0000 with its code section at +0x1000: a line row at
        // section-relative 0x2966 lands at absolute 0x001d3966.
        let m = module("smackw32.dll", 0x001d_0000, 0, 0x1000);
        let absolute = GlobalAddress::from(0x2966u32).relocate(&m);
        assert_eq!(absolute, 0x001d_3966.into());
        assert_eq!(absolute.into_global(&m), 0x2966u32.into());
    }

    #[test]
    fn test_module_name_lookup_is_case_insensitive() {
        let manager = manager_with(vec![module("SMACKW32.DLL", 0x001d_0000, 0, 0)]);
        assert!(manager.module_by_name("smackw32.dll").is_some());
        assert!(manager.module_by_name("SmackW32.Dll").is_some());
        assert!(manager.module_by_name("other.dll").is_none());
    }
}
