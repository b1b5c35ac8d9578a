pub mod eval;
pub mod line;
pub mod r#type;
pub mod unit;
pub mod variable;

use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use crate::dwarf::line::{LineCache, SourceLocation};
use crate::dwarf::unit::{IndexedUnit, Subprogram, TypeDieLocation, TypeRef, VariableDescriptor};
use fallible_iterator::FallibleIterator;
use gimli::{Dwarf, RunTimeEndian, SectionId};
use log::{debug, info};
use memmap2::Mmap;
use object::{Object, ObjectSection};
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Magic bytes of an ELF image, used to locate the appended debug container.
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
/// Smallest possible ELF header (32-bit class).
const ELF_HEADER_LEN: usize = 52;

/// Where the DWARF sections were found inside the PE file.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DwarfFormat {
    /// Plain `.debug_*` sections in the PE image itself.
    PeSections,
    /// An ELF image appended to the PE file, the Watcom way.
    AppendedElf,
}

/// Parsed and indexed debug information of a single module.
pub struct DebugInformation {
    file: PathBuf,
    format: DwarfFormat,
    dwarf: Dwarf<EndianArcSlice>,
    units: Vec<IndexedUnit>,
    /// Absolute `.debug_info` offset of every type DIE.
    types: HashMap<TypeRef, TypeDieLocation>,
    line_cache: LineCache,
}

impl DebugInformation {
    /// Locate and parse DWARF debug information of a PE file.
    ///
    /// Tried in order: standard `.debug_*` PE sections, then a scan for an
    /// appended ELF container. Returns `Ok(None)` when the file carries no
    /// recognizable debug information at all.
    pub fn load(path: &Path) -> Result<Option<DebugInformation>, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let data = &*mmap;

        let (dwarf, format) = match Self::try_pe_sections(data)? {
            Some(dwarf) => (dwarf, DwarfFormat::PeSections),
            None => match Self::try_appended_elf(data)? {
                Some(dwarf) => (dwarf, DwarfFormat::AppendedElf),
                None => return Ok(None),
            },
        };

        let headers: Vec<_> = dwarf.units().collect()?;

        // Unit indexing is independent per compilation unit, run it on a thread pool.
        let mut units = headers
            .into_par_iter()
            .map(|header| IndexedUnit::parse(&dwarf, header))
            .collect::<Result<Vec<_>, _>>()?;

        let mut types = HashMap::new();
        let mut rows = vec![];
        for (idx, unit) in units.iter_mut().enumerate() {
            unit.set_idx(idx);
            for (type_ref, unit_offset) in &unit.type_offsets {
                types.insert(
                    *type_ref,
                    TypeDieLocation {
                        unit_idx: idx,
                        offset: *unit_offset,
                    },
                );
            }
            rows.extend(unit.line_rows.iter().cloned());
        }
        let line_cache = LineCache::new(rows);

        info!(
            target: "dwarf",
            "{}: dwarf 2 debug info loaded ({format:?}, {} units, {} subprograms, {} types)",
            path.display(),
            units.len(),
            units.iter().map(|u| u.subprograms.len()).sum::<usize>(),
            types.len(),
        );

        Ok(Some(DebugInformation {
            file: path.to_path_buf(),
            format,
            dwarf,
            units,
            types,
            line_cache,
        }))
    }

    fn load_section(
        id: SectionId,
        file: &object::File,
        endian: RunTimeEndian,
    ) -> Result<EndianArcSlice, Error> {
        let data = file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[]));
        Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
    }

    fn load_object(file: &object::File) -> Result<Option<Dwarf<EndianArcSlice>>, Error> {
        if file.section_by_name(".debug_info").is_none() {
            return Ok(None);
        }
        let dwarf = Dwarf::load(|id| Self::load_section(id, file, RunTimeEndian::Little))?;
        Ok(Some(dwarf))
    }

    fn try_pe_sections(data: &[u8]) -> Result<Option<Dwarf<EndianArcSlice>>, Error> {
        let file = match object::File::parse(data) {
            Ok(file) => file,
            Err(_) => return Ok(None),
        };
        Self::load_object(&file)
    }

    fn try_appended_elf(data: &[u8]) -> Result<Option<Dwarf<EndianArcSlice>>, Error> {
        let offset = match data.windows(ELF_MAGIC.len()).position(|w| w == ELF_MAGIC) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let elf_data = &data[offset..];
        if elf_data.len() < ELF_HEADER_LEN {
            debug!(target: "dwarf", "appended container smaller than an elf header, ignored");
            return Ok(None);
        }
        let file = match object::File::parse(elf_data) {
            Ok(file) => file,
            Err(e) => {
                debug!(target: "dwarf", "appended elf container unparsable: {e}");
                return Ok(None);
            }
        };
        Self::load_object(&file)
    }

    pub fn pathname(&self) -> &Path {
        self.file.as_path()
    }

    pub fn format(&self) -> DwarfFormat {
        self.format
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn unit(&self, idx: usize) -> &IndexedUnit {
        &self.units[idx]
    }

    /// All source files mentioned by the line programs.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.line_cache.files()
    }

    /// Map a section-relative address to the closest source place at or before it.
    pub fn find_place(&self, addr: GlobalAddress) -> Option<&SourceLocation> {
        self.line_cache.address_to_line(addr)
    }

    /// Map a source place to the first section-relative address of the line.
    pub fn find_line_address(&self, file: &str, line: u64) -> Option<GlobalAddress> {
        self.line_cache.line_to_address(file, line)
    }

    /// Find the subprogram whose range contains the address.
    pub fn find_subprogram(&self, addr: GlobalAddress) -> Option<&Subprogram> {
        self.units
            .iter()
            .flat_map(|unit| unit.subprograms.iter())
            .find(|sub| sub.contains(addr))
    }

    /// Collect formal parameters and local variables of a subprogram,
    /// recursing through nested lexical blocks.
    pub fn subprogram_variables(
        &self,
        subprogram: &Subprogram,
    ) -> Result<Vec<VariableDescriptor>, Error> {
        self.units[subprogram.unit_idx()].variables_of(&self.dwarf, subprogram)
    }

    pub(crate) fn type_die_location(&self, type_ref: TypeRef) -> Option<&TypeDieLocation> {
        self.types.get(&type_ref)
    }

    pub(crate) fn dwarf(&self) -> &Dwarf<EndianArcSlice> {
        &self.dwarf
    }
}
