use crate::dwarf::unit::{die_name, type_ref_of, TypeDieLocation, TypeRef};
use crate::dwarf::{DebugInformation, EndianArcSlice};
use gimli::{constants, AttributeValue, DwAte, Operation};
use itertools::Itertools;
use std::collections::HashMap;
use std::rc::Rc;

/// Struct formatting recurses at most this deep. Cyclic type graphs are keyed
/// by DIE offset, so a depth limit (not cycle detection) bounds the output.
const MAX_FORMAT_DEPTH: usize = 3;
/// How many array elements are rendered before the ellipsis.
const MAX_ARRAY_ELEMENTS: u64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct StructMember {
    pub name: String,
    pub type_ref: Option<TypeRef>,
    /// Byte offset of the member inside the structure.
    pub offset: u64,
}

/// The type system as a sum over DWARF type DIE kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Base {
        name: String,
        byte_size: u64,
        encoding: DwAte,
    },
    Pointer {
        pointee: Option<TypeRef>,
        byte_size: u64,
    },
    Struct {
        name: Option<String>,
        byte_size: u64,
        members: Vec<StructMember>,
    },
    Array {
        element: Option<TypeRef>,
        count: Option<u64>,
    },
    Typedef {
        name: String,
        underlying: Option<TypeRef>,
    },
    Const {
        underlying: Option<TypeRef>,
    },
}

/// Lazy DIE-offset-keyed type resolution and value rendering.
pub struct TypeResolver<'a> {
    debug_info: &'a DebugInformation,
    cache: HashMap<TypeRef, Option<Rc<TypeKind>>>,
}

impl<'a> TypeResolver<'a> {
    pub fn new(debug_info: &'a DebugInformation) -> Self {
        Self {
            debug_info,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, type_ref: TypeRef) -> Option<Rc<TypeKind>> {
        if let Some(cached) = self.cache.get(&type_ref) {
            return cached.clone();
        }
        let resolved = self.parse_type_die(type_ref).map(Rc::new);
        self.cache.insert(type_ref, resolved.clone());
        resolved
    }

    fn parse_type_die(&self, type_ref: TypeRef) -> Option<TypeKind> {
        let location = *self.debug_info.type_die_location(type_ref)?;
        let unit = &self.debug_info.unit(location.unit_idx).unit;
        let dwarf = self.debug_info.dwarf();
        let entry = unit.entry(location.offset).ok()?;

        let name = die_name(dwarf, unit, &entry).ok().flatten();
        let byte_size = entry
            .attr_value(constants::DW_AT_byte_size)
            .ok()
            .flatten()
            .and_then(|v| v.udata_value());
        let referenced = entry
            .attr_value(constants::DW_AT_type)
            .ok()
            .flatten()
            .and_then(|v| type_ref_of(unit, v));

        match entry.tag() {
            constants::DW_TAG_base_type => {
                let encoding = entry
                    .attr_value(constants::DW_AT_encoding)
                    .ok()
                    .flatten()
                    .and_then(|v| v.udata_value())
                    .map(|v| DwAte(v as u8))
                    .unwrap_or(constants::DW_ATE_signed);
                Some(TypeKind::Base {
                    name: name.unwrap_or_else(|| "unknown".to_string()),
                    byte_size: byte_size.unwrap_or(0),
                    encoding,
                })
            }
            constants::DW_TAG_pointer_type => Some(TypeKind::Pointer {
                pointee: referenced,
                byte_size: byte_size.unwrap_or(4),
            }),
            constants::DW_TAG_structure_type => Some(TypeKind::Struct {
                name,
                byte_size: byte_size.unwrap_or(0),
                members: self.parse_struct_members(&location),
            }),
            constants::DW_TAG_typedef => Some(TypeKind::Typedef {
                name: name.unwrap_or_else(|| "unnamed".to_string()),
                underlying: referenced,
            }),
            constants::DW_TAG_const_type => Some(TypeKind::Const {
                underlying: referenced,
            }),
            constants::DW_TAG_array_type => Some(TypeKind::Array {
                element: referenced,
                count: self.parse_array_count(&location),
            }),
            _ => None,
        }
    }

    fn parse_struct_members(&self, location: &TypeDieLocation) -> Vec<StructMember> {
        let unit = &self.debug_info.unit(location.unit_idx).unit;
        let dwarf = self.debug_info.dwarf();

        let mut members = vec![];
        let Ok(mut tree) = unit.entries_tree(Some(location.offset)) else {
            return members;
        };
        let Ok(root) = tree.root() else {
            return members;
        };
        let mut children = root.children();
        while let Ok(Some(node)) = children.next() {
            let entry = node.entry();
            if entry.tag() != constants::DW_TAG_member {
                continue;
            }
            let name = die_name(dwarf, unit, entry)
                .ok()
                .flatten()
                .unwrap_or_else(|| "unnamed".to_string());
            let type_ref = entry
                .attr_value(constants::DW_AT_type)
                .ok()
                .flatten()
                .and_then(|v| type_ref_of(unit, v));
            let offset = entry
                .attr_value(constants::DW_AT_data_member_location)
                .ok()
                .flatten()
                .and_then(|value| member_offset(value, unit.encoding()))
                .unwrap_or(0);
            members.push(StructMember {
                name,
                type_ref,
                offset,
            });
        }
        members
    }

    fn parse_array_count(&self, location: &TypeDieLocation) -> Option<u64> {
        let unit = &self.debug_info.unit(location.unit_idx).unit;
        let mut tree = unit.entries_tree(Some(location.offset)).ok()?;
        let root = tree.root().ok()?;
        let mut children = root.children();
        while let Ok(Some(node)) = children.next() {
            let entry = node.entry();
            if entry.tag() != constants::DW_TAG_subrange_type {
                continue;
            }
            if let Ok(Some(value)) = entry.attr_value(constants::DW_AT_count) {
                return value.udata_value();
            }
            if let Ok(Some(value)) = entry.attr_value(constants::DW_AT_upper_bound) {
                // The upper bound is inclusive.
                return value.udata_value().map(|upper| upper + 1);
            }
        }
        None
    }

    /// Size in bytes a value of this type occupies in memory.
    pub fn byte_size(&mut self, type_ref: TypeRef) -> u64 {
        match self.resolve(type_ref).as_deref() {
            Some(TypeKind::Base { byte_size, .. }) if *byte_size > 0 => *byte_size,
            Some(TypeKind::Pointer { byte_size, .. }) => *byte_size,
            Some(TypeKind::Struct { byte_size, .. }) if *byte_size > 0 => *byte_size,
            Some(TypeKind::Typedef {
                underlying: Some(underlying),
                ..
            })
            | Some(TypeKind::Const {
                underlying: Some(underlying),
            }) => self.byte_size(*underlying),
            Some(TypeKind::Array { element, count }) => {
                let element_size = element.map(|e| self.byte_size(e)).unwrap_or(4);
                element_size * count.unwrap_or(MAX_ARRAY_ELEMENTS).min(256)
            }
            _ => 4,
        }
    }

    /// Human readable type name, e.g. `int`, `char*`, `struct Point`, `int[8]`.
    pub fn type_name(&mut self, type_ref: TypeRef) -> String {
        match self.resolve(type_ref).as_deref() {
            Some(TypeKind::Base { name, .. }) => name.clone(),
            Some(TypeKind::Pointer { pointee, .. }) => match pointee {
                Some(pointee) => format!("{}*", self.type_name(*pointee)),
                None => "void*".to_string(),
            },
            Some(TypeKind::Struct { name, .. }) => match name {
                Some(name) => format!("struct {name}"),
                None => "struct <anonymous>".to_string(),
            },
            Some(TypeKind::Typedef { name, .. }) => name.clone(),
            Some(TypeKind::Const { underlying }) => match underlying {
                Some(underlying) => self.type_name(*underlying),
                None => "const void".to_string(),
            },
            Some(TypeKind::Array { element, count }) => {
                let element_name = element
                    .map(|e| self.type_name(e))
                    .unwrap_or_else(|| "array".to_string());
                match count {
                    Some(count) => format!("{element_name}[{count}]"),
                    None => format!("{element_name}[]"),
                }
            }
            None => "unknown".to_string(),
        }
    }

    /// Render raw memory bytes according to the type.
    pub fn format_value(&mut self, raw: &[u8], type_ref: TypeRef) -> String {
        self.format_value_depth(raw, type_ref, MAX_FORMAT_DEPTH)
    }

    fn format_value_depth(&mut self, raw: &[u8], type_ref: TypeRef, depth: usize) -> String {
        if depth == 0 {
            return "...".to_string();
        }

        match self.resolve(type_ref).as_deref().cloned() {
            Some(TypeKind::Base {
                byte_size,
                encoding,
                ..
            }) => format_base(raw, byte_size, encoding),
            Some(TypeKind::Pointer { byte_size, .. }) => format_pointer(raw, byte_size),
            Some(TypeKind::Struct { members, .. }) => {
                self.format_struct(raw, &members, depth - 1)
            }
            Some(TypeKind::Typedef {
                underlying: Some(underlying),
                ..
            })
            | Some(TypeKind::Const {
                underlying: Some(underlying),
            }) => self.format_value_depth(raw, underlying, depth),
            Some(TypeKind::Typedef { .. }) => "<unknown typedef>".to_string(),
            Some(TypeKind::Array { element, count }) => {
                self.format_array(raw, element, count, depth - 1)
            }
            _ => hex_dump(raw),
        }
    }

    fn format_struct(&mut self, raw: &[u8], members: &[StructMember], depth: usize) -> String {
        if members.is_empty() {
            return "{}".to_string();
        }
        let rendered = members
            .iter()
            .filter(|m| (m.offset as usize) < raw.len())
            .map(|m| {
                let value = match m.type_ref {
                    Some(type_ref) => {
                        self.format_value_depth(&raw[m.offset as usize..], type_ref, depth)
                    }
                    None => hex_dump(&raw[m.offset as usize..]),
                };
                format!("{}={}", m.name, value)
            })
            .join(", ");
        format!("{{ {rendered} }}")
    }

    fn format_array(
        &mut self,
        raw: &[u8],
        element: Option<TypeRef>,
        count: Option<u64>,
        depth: usize,
    ) -> String {
        let Some(element) = element else {
            return "[...]".to_string();
        };
        let element_size = self.byte_size(element) as usize;
        if element_size == 0 {
            return "[...]".to_string();
        }

        let shown = count.unwrap_or(MAX_ARRAY_ELEMENTS).min(MAX_ARRAY_ELEMENTS);
        let mut parts = vec![];
        for i in 0..shown as usize {
            let offset = i * element_size;
            if offset + element_size > raw.len() {
                break;
            }
            parts.push(self.format_value_depth(
                &raw[offset..offset + element_size],
                element,
                depth,
            ));
        }
        if count.map(|c| c > shown).unwrap_or(false) {
            parts.push("...".to_string());
        }
        format!("[{}]", parts.join(", "))
    }
}

/// A DWARF 2 data-member location is a constant in the common case, but may
/// also be a block of the form `DW_OP_plus_uconst <offset>`.
fn member_offset(value: AttributeValue<EndianArcSlice>, encoding: gimli::Encoding) -> Option<u64> {
    if let Some(offset) = value.udata_value() {
        return Some(offset);
    }
    let expression = value.exprloc_value()?;
    let mut reader = expression.0;
    match Operation::parse(&mut reader, encoding).ok()? {
        Operation::PlusConstant { value } => Some(value),
        _ => None,
    }
}

fn format_base(raw: &[u8], byte_size: u64, encoding: DwAte) -> String {
    let size = byte_size as usize;
    if raw.len() < size || size == 0 {
        return hex_dump(raw);
    }
    let signed = matches!(
        encoding,
        constants::DW_ATE_signed | constants::DW_ATE_signed_char
    );
    match size {
        1 => {
            if signed {
                (raw[0] as i8).to_string()
            } else {
                raw[0].to_string()
            }
        }
        2 => {
            let bytes = [raw[0], raw[1]];
            if signed {
                i16::from_le_bytes(bytes).to_string()
            } else {
                u16::from_le_bytes(bytes).to_string()
            }
        }
        4 => {
            let bytes = [raw[0], raw[1], raw[2], raw[3]];
            if encoding == constants::DW_ATE_float {
                f32::from_le_bytes(bytes).to_string()
            } else if signed {
                i32::from_le_bytes(bytes).to_string()
            } else {
                u32::from_le_bytes(bytes).to_string()
            }
        }
        8 => {
            let bytes: [u8; 8] = raw[..8].try_into().expect("length checked");
            if encoding == constants::DW_ATE_float {
                f64::from_le_bytes(bytes).to_string()
            } else if signed {
                i64::from_le_bytes(bytes).to_string()
            } else {
                u64::from_le_bytes(bytes).to_string()
            }
        }
        _ => hex_dump(&raw[..size]),
    }
}

fn format_pointer(raw: &[u8], byte_size: u64) -> String {
    match byte_size {
        4 if raw.len() >= 4 => {
            let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            format!("{value:#010x}")
        }
        8 if raw.len() >= 8 => {
            let bytes: [u8; 8] = raw[..8].try_into().expect("length checked");
            let value = u64::from_le_bytes(bytes);
            format!("{value:#018x}")
        }
        _ => hex_dump(raw),
    }
}

fn hex_dump(raw: &[u8]) -> String {
    if raw.is_empty() {
        return "<empty>".to_string();
    }
    let dump = raw.iter().take(16).map(|b| format!("{b:02x}")).join(" ");
    if raw.len() > 16 {
        format!("<{dump}...>")
    } else {
        format!("<{dump}>")
    }
}
