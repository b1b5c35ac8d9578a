use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use crate::dwarf::line::SourceLocation;
use crate::dwarf::EndianArcSlice;
use gimli::{
    constants, AttributeValue, ColumnType, Dwarf, EntriesTreeIter, Expression, LineProgramHeader,
    Reader, Unit, UnitHeader, UnitOffset,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Reference to a type DIE by its absolute `.debug_info` offset.
///
/// Absolute offsets are stable across the whole module, which makes them a
/// safe key for cyclic type graphs (a struct holding a pointer to itself).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeRef(pub u64);

/// Where a type DIE lives: owning unit and unit-relative offset.
#[derive(Copy, Clone, Debug)]
pub struct TypeDieLocation {
    pub unit_idx: usize,
    pub offset: UnitOffset,
}

/// An indexed function DIE.
#[derive(Debug)]
pub struct Subprogram {
    pub name: String,
    /// Section-relative start address.
    pub low_pc: GlobalAddress,
    /// Section-relative end address (exclusive).
    pub high_pc: GlobalAddress,
    pub(super) frame_base: Option<Expression<EndianArcSlice>>,
    pub(super) die_offset: UnitOffset,
    pub(super) unit_idx: usize,
}

impl Subprogram {
    pub fn contains(&self, addr: GlobalAddress) -> bool {
        addr.in_range(self.low_pc, self.high_pc)
    }

    pub fn frame_base(&self) -> Option<&Expression<EndianArcSlice>> {
        self.frame_base.as_ref()
    }

    pub fn unit_idx(&self) -> usize {
        self.unit_idx
    }
}

/// A formal parameter or local variable DIE of a subprogram.
#[derive(Debug, Clone)]
pub struct VariableDescriptor {
    pub name: String,
    pub type_ref: Option<TypeRef>,
    pub location: Option<Expression<EndianArcSlice>>,
    pub const_value: Option<i64>,
    pub is_parameter: bool,
}

/// One compilation unit with its indexes, built once at module load.
pub struct IndexedUnit {
    pub(crate) unit: Unit<EndianArcSlice>,
    pub name: Option<String>,
    pub subprograms: Vec<Subprogram>,
    pub(super) type_offsets: Vec<(TypeRef, UnitOffset)>,
    pub(super) line_rows: Vec<SourceLocation>,
}

impl IndexedUnit {
    pub(super) fn parse(
        dwarf: &Dwarf<EndianArcSlice>,
        header: UnitHeader<EndianArcSlice>,
    ) -> Result<IndexedUnit, Error> {
        let unit = dwarf.unit(header)?;
        let name = unit
            .name
            .as_ref()
            .and_then(|r| r.to_string_lossy().ok())
            .map(|s| s.into_owned());

        let mut subprograms = vec![];
        let mut type_offsets = vec![];
        {
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                match entry.tag() {
                    constants::DW_TAG_subprogram => {
                        if let Some(sub) = parse_subprogram(dwarf, &unit, entry)? {
                            subprograms.push(sub);
                        }
                    }
                    constants::DW_TAG_base_type
                    | constants::DW_TAG_pointer_type
                    | constants::DW_TAG_structure_type
                    | constants::DW_TAG_typedef
                    | constants::DW_TAG_const_type
                    | constants::DW_TAG_array_type => {
                        if let Some(global) = entry.offset().to_debug_info_offset(&unit.header) {
                            type_offsets.push((TypeRef(global.0 as u64), entry.offset()));
                        }
                    }
                    _ => {}
                }
            }
        }

        let line_rows = parse_line_rows(dwarf, &unit, &name)?;

        Ok(IndexedUnit {
            unit,
            name,
            subprograms,
            type_offsets,
            line_rows,
        })
    }

    pub(super) fn set_idx(&mut self, idx: usize) {
        for sub in &mut self.subprograms {
            sub.unit_idx = idx;
        }
    }

    pub(crate) fn encoding(&self) -> gimli::Encoding {
        self.unit.encoding()
    }

    /// Collect parameters and variables of a subprogram, recursing through
    /// nested lexical blocks. Artificial (compiler-generated) entries are skipped.
    pub(super) fn variables_of(
        &self,
        dwarf: &Dwarf<EndianArcSlice>,
        subprogram: &Subprogram,
    ) -> Result<Vec<VariableDescriptor>, Error> {
        let mut tree = self.unit.entries_tree(Some(subprogram.die_offset))?;
        let root = tree.root()?;
        let mut variables = vec![];
        self.collect_variables(dwarf, root.children(), &mut variables)?;
        Ok(variables)
    }

    fn collect_variables(
        &self,
        dwarf: &Dwarf<EndianArcSlice>,
        mut children: EntriesTreeIter<EndianArcSlice>,
        out: &mut Vec<VariableDescriptor>,
    ) -> Result<(), Error> {
        while let Some(node) = children.next()? {
            let tag = node.entry().tag();
            match tag {
                constants::DW_TAG_variable | constants::DW_TAG_formal_parameter => {
                    if let Some(var) = parse_variable(
                        dwarf,
                        &self.unit,
                        node.entry(),
                        tag == constants::DW_TAG_formal_parameter,
                    )? {
                        out.push(var);
                    }
                }
                constants::DW_TAG_lexical_block => {
                    self.collect_variables(dwarf, node.children(), out)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub(super) fn die_name(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Result<Option<String>, Error> {
    let Some(value) = entry.attr_value(constants::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf
        .attr_string(unit, value)?
        .to_string_lossy()?
        .into_owned();
    Ok(Some(name))
}

pub(super) fn type_ref_of(
    unit: &Unit<EndianArcSlice>,
    value: AttributeValue<EndianArcSlice>,
) -> Option<TypeRef> {
    match value {
        AttributeValue::UnitRef(offset) => offset
            .to_debug_info_offset(&unit.header)
            .map(|o| TypeRef(o.0 as u64)),
        AttributeValue::DebugInfoRef(offset) => Some(TypeRef(offset.0 as u64)),
        _ => None,
    }
}

fn parse_subprogram(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Result<Option<Subprogram>, Error> {
    let Some(name) = die_name(dwarf, unit, entry)? else {
        return Ok(None);
    };

    let low_pc = match entry.attr_value(constants::DW_AT_low_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        Some(value) => match value.udata_value() {
            Some(addr) => addr,
            None => return Ok(None),
        },
        None => return Ok(None),
    };

    // high_pc is either an absolute address or an offset from low_pc,
    // discriminated by the attribute form class.
    let high_pc = match entry.attr_value(constants::DW_AT_high_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        Some(value) => low_pc + value.udata_value().unwrap_or(1),
        None => low_pc + 1,
    };

    let frame_base = entry
        .attr_value(constants::DW_AT_frame_base)?
        .and_then(|value| value.exprloc_value());

    Ok(Some(Subprogram {
        name,
        low_pc: GlobalAddress::from(low_pc),
        high_pc: GlobalAddress::from(high_pc),
        frame_base,
        die_offset: entry.offset(),
        unit_idx: 0,
    }))
}

fn parse_variable(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    is_parameter: bool,
) -> Result<Option<VariableDescriptor>, Error> {
    let Some(name) = die_name(dwarf, unit, entry)? else {
        return Ok(None);
    };

    if let Some(AttributeValue::Flag(true)) = entry.attr_value(constants::DW_AT_artificial)? {
        return Ok(None);
    }

    let type_ref = entry
        .attr_value(constants::DW_AT_type)?
        .and_then(|value| type_ref_of(unit, value));

    let location = entry
        .attr_value(constants::DW_AT_location)?
        .and_then(|value| value.exprloc_value());

    let const_value = entry
        .attr_value(constants::DW_AT_const_value)?
        .and_then(|value| {
            value
                .sdata_value()
                .or_else(|| value.udata_value().map(|u| u as i64))
        });

    Ok(Some(VariableDescriptor {
        name,
        type_ref,
        location,
        const_value,
        is_parameter,
    }))
}

fn parse_line_rows(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    unit_name: &Option<String>,
) -> Result<Vec<SourceLocation>, Error> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(vec![]);
    };

    let mut file_memo: HashMap<u64, Option<PathBuf>> = HashMap::new();
    let mut line_rows = vec![];
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        if row.end_sequence() {
            continue;
        }

        // Watcom line programs carry an empty file table; the compile unit
        // name is then the single source file for every row. The file table
        // is consulted per row, not up front, so lazily populated headers
        // still resolve.
        let file = if header.file_names().is_empty() {
            match unit_name {
                Some(name) => PathBuf::from(name),
                None => continue,
            }
        } else {
            let resolved = file_memo
                .entry(row.file_index())
                .or_insert_with(|| resolve_file(dwarf, unit, header, row.file_index()));
            match resolved {
                Some(path) => path.clone(),
                None => continue,
            }
        };

        let line = row.line().map(|l| l.get()).unwrap_or(0);
        let column = match row.column() {
            ColumnType::LeftEdge => 0,
            ColumnType::Column(c) => c.get(),
        };

        line_rows.push(SourceLocation {
            file,
            line,
            column,
            address: GlobalAddress::from(row.address()),
        });
    }

    Ok(line_rows)
}

fn resolve_file(
    dwarf: &Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    header: &LineProgramHeader<EndianArcSlice>,
    file_index: u64,
) -> Option<PathBuf> {
    let entry = header.file(file_index)?;
    let name = dwarf
        .attr_string(unit, entry.path_name())
        .ok()?
        .to_string_lossy()
        .ok()?
        .into_owned();

    // Directory index 0 refers to the compilation directory of the unit.
    let dir = match entry.directory(header) {
        Some(dir_value) => dwarf
            .attr_string(unit, dir_value)
            .ok()
            .and_then(|r| r.to_string_lossy().ok().map(|s| s.into_owned())),
        None => unit
            .comp_dir
            .as_ref()
            .and_then(|r| r.to_string_lossy().ok())
            .map(|s| s.into_owned()),
    };

    let path = match dir {
        Some(dir) if !Path::new(&name).is_absolute() => PathBuf::from(dir).join(&name),
        _ => PathBuf::from(&name),
    };
    Some(path)
}
