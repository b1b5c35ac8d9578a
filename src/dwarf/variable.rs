use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use crate::debugger::process::ProcessAccess;
use crate::debugger::register::Register;
use crate::dwarf::eval::{classify, EvalOption, ExpressionEvaluator, LocationClass};
use crate::dwarf::r#type::TypeResolver;
use crate::dwarf::unit::VariableDescriptor;
use crate::dwarf::DebugInformation;
use serde::Serialize;
use strum_macros::Display;

/// Where an inspected value was found.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VariableLocation {
    Stack,
    Register,
    Global,
    Constant,
    Unavailable,
    Error,
    Unknown,
}

/// A fully rendered variable at a stop.
#[derive(Clone, Debug, Serialize)]
pub struct Variable {
    pub name: String,
    pub type_name: String,
    pub value: String,
    pub location: VariableLocation,
    pub address: Option<String>,
    pub is_parameter: bool,
}

/// Renders every variable visible at an address by combining the DIE index,
/// the location evaluator and the type formatter.
pub struct VariableInspector<'a, P: ProcessAccess> {
    debug_info: &'a DebugInformation,
    process: &'a P,
}

impl<'a, P: ProcessAccess> VariableInspector<'a, P> {
    pub fn new(debug_info: &'a DebugInformation, process: &'a P) -> Self {
        Self {
            debug_info,
            process,
        }
    }

    /// Inspect all parameters and locals of the subprogram containing
    /// `address` (section-relative). `module_base` relocates `DW_OP_addr`
    /// constants of global variables.
    pub fn variables_at(
        &self,
        address: GlobalAddress,
        thread_id: u32,
        module_base: u32,
    ) -> Result<Vec<Variable>, Error> {
        let Some(subprogram) = self.debug_info.find_subprogram(address) else {
            return Ok(vec![]);
        };

        let encoding = self.debug_info.unit(subprogram.unit_idx()).encoding();
        let evaluator = ExpressionEvaluator::new(self.process, thread_id, encoding);

        let frame_base = self.frame_base(subprogram, &evaluator, thread_id, module_base);

        let mut resolver = TypeResolver::new(self.debug_info);
        let variables = self
            .debug_info
            .subprogram_variables(subprogram)?
            .into_iter()
            .map(|descriptor| {
                self.inspect(&descriptor, &evaluator, &mut resolver, frame_base, module_base)
            })
            .collect();
        Ok(variables)
    }

    /// The frame base anchors `DW_OP_fbreg` locals. It is usually an
    /// expression over `ebp`; when absent or failing, `ebp` itself is the
    /// best available anchor.
    fn frame_base(
        &self,
        subprogram: &crate::dwarf::unit::Subprogram,
        evaluator: &ExpressionEvaluator<'a, P>,
        thread_id: u32,
        module_base: u32,
    ) -> Option<u32> {
        if let Some(expr) = subprogram.frame_base() {
            let opts = EvalOption::new().with_module_base(module_base);
            if let Ok(value) = evaluator.evaluate_with_opts(expr, opts) {
                return Some(value);
            }
        }
        self.process.register(thread_id, Register::Ebp).ok()
    }

    fn inspect(
        &self,
        descriptor: &VariableDescriptor,
        evaluator: &ExpressionEvaluator<'a, P>,
        resolver: &mut TypeResolver,
        frame_base: Option<u32>,
        module_base: u32,
    ) -> Variable {
        let type_name = descriptor
            .type_ref
            .map(|t| resolver.type_name(t))
            .unwrap_or_else(|| "unknown".to_string());

        // A constant value wins over any location: the variable was folded
        // away but its value is known.
        if let Some(const_value) = descriptor.const_value {
            return Variable {
                name: descriptor.name.clone(),
                type_name,
                value: const_value.to_string(),
                location: VariableLocation::Constant,
                address: None,
                is_parameter: descriptor.is_parameter,
            };
        }

        let Some(location) = &descriptor.location else {
            return Variable {
                name: descriptor.name.clone(),
                type_name,
                value: "<unavailable>".to_string(),
                location: VariableLocation::Unavailable,
                address: None,
                is_parameter: descriptor.is_parameter,
            };
        };

        let mut opts = EvalOption::new().with_module_base(module_base);
        if let Some(frame_base) = frame_base {
            opts = opts.with_frame_base(frame_base);
        }

        let result = match evaluator.evaluate_with_opts(location, opts) {
            Ok(result) => result,
            Err(e) => {
                return Variable {
                    name: descriptor.name.clone(),
                    type_name,
                    value: format!("<unavailable: {e}>"),
                    location: VariableLocation::Unavailable,
                    address: None,
                    is_parameter: descriptor.is_parameter,
                };
            }
        };

        match classify(location) {
            LocationClass::Register => {
                // The register contents are the value, no memory read.
                let raw = result.to_le_bytes();
                let value = match descriptor.type_ref {
                    Some(type_ref) => resolver.format_value(&raw, type_ref),
                    None => format!("{result:#010x}"),
                };
                Variable {
                    name: descriptor.name.clone(),
                    type_name,
                    value,
                    location: VariableLocation::Register,
                    address: None,
                    is_parameter: descriptor.is_parameter,
                }
            }
            class => {
                let location_kind = match class {
                    LocationClass::Stack => VariableLocation::Stack,
                    LocationClass::Global => VariableLocation::Global,
                    _ => VariableLocation::Unknown,
                };
                let (value, location_kind) =
                    self.read_and_format(result, descriptor.type_ref, resolver, location_kind);
                Variable {
                    name: descriptor.name.clone(),
                    type_name,
                    value,
                    location: location_kind,
                    address: Some(format!("{result:#010x}")),
                    is_parameter: descriptor.is_parameter,
                }
            }
        }
    }

    fn read_and_format(
        &self,
        address: u32,
        type_ref: Option<crate::dwarf::unit::TypeRef>,
        resolver: &mut TypeResolver,
        location_kind: VariableLocation,
    ) -> (String, VariableLocation) {
        let Some(type_ref) = type_ref else {
            return (format!("<at {address:#010x}>"), location_kind);
        };

        let size = resolver.byte_size(type_ref).max(1) as usize;
        match self.process.read_memory(address.into(), size) {
            Ok(raw) => (resolver.format_value(&raw, type_ref), location_kind),
            Err(e) => (format!("<unreadable: {e}>"), VariableLocation::Error),
        }
    }
}
