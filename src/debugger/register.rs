use crate::debugger::error::Error;
use serde::Serialize;
use strum_macros::{Display, EnumString};

/// Trap flag bit in EFLAGS. Setting it raises a single-step exception after
/// the next instruction retires.
pub const TRAP_FLAG: u32 = 0x100;

/// The 32-bit x86 general purpose register set exposed to callers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
    Eflags,
}

impl Register {
    /// Map a DWARF register number to a machine register
    /// (x86 DWARF numbering, 32-bit flavour).
    pub fn from_dwarf(reg: gimli::Register) -> Result<Self, Error> {
        let register = match reg.0 {
            0 => Register::Eax,
            1 => Register::Ecx,
            2 => Register::Edx,
            3 => Register::Ebx,
            4 => Register::Esp,
            5 => Register::Ebp,
            6 => Register::Esi,
            7 => Register::Edi,
            8 => Register::Eip,
            _ => return Err(Error::RegisterNotFound(reg.0)),
        };
        Ok(register)
    }
}

/// A snapshot of all general purpose registers for one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegisterFile {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

impl RegisterFile {
    pub fn value(&self, register: Register) -> u32 {
        match register {
            Register::Eax => self.eax,
            Register::Ebx => self.ebx,
            Register::Ecx => self.ecx,
            Register::Edx => self.edx,
            Register::Esi => self.esi,
            Register::Edi => self.edi,
            Register::Ebp => self.ebp,
            Register::Esp => self.esp,
            Register::Eip => self.eip,
            Register::Eflags => self.eflags,
        }
    }

    pub fn update(&mut self, register: Register, value: u32) {
        match register {
            Register::Eax => self.eax = value,
            Register::Ebx => self.ebx = value,
            Register::Ecx => self.ecx = value,
            Register::Edx => self.edx = value,
            Register::Esi => self.esi = value,
            Register::Edi => self.edi = value,
            Register::Ebp => self.ebp = value,
            Register::Esp => self.esp = value,
            Register::Eip => self.eip = value,
            Register::Eflags => self.eflags = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_register_names_parse() {
        assert_eq!(Register::from_str("eax").unwrap(), Register::Eax);
        assert_eq!(Register::from_str("EFlags").unwrap(), Register::Eflags);
        assert_eq!(Register::from_str("EIP").unwrap(), Register::Eip);
        assert!(Register::from_str("rax").is_err());
    }

    #[test]
    fn test_dwarf_register_numbering() {
        assert_eq!(
            Register::from_dwarf(gimli::Register(0)).unwrap(),
            Register::Eax
        );
        assert_eq!(
            Register::from_dwarf(gimli::Register(1)).unwrap(),
            Register::Ecx
        );
        assert_eq!(
            Register::from_dwarf(gimli::Register(4)).unwrap(),
            Register::Esp
        );
        assert_eq!(
            Register::from_dwarf(gimli::Register(8)).unwrap(),
            Register::Eip
        );
        assert!(Register::from_dwarf(gimli::Register(16)).is_err());
    }

    #[test]
    fn test_register_file_roundtrip() {
        let mut file = RegisterFile::default();
        file.update(Register::Edx, 0xDEAD);
        file.update(Register::Eflags, TRAP_FLAG);
        assert_eq!(file.value(Register::Edx), 0xDEAD);
        assert_eq!(file.value(Register::Eflags) & TRAP_FLAG, TRAP_FLAG);
    }
}
