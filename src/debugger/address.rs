use crate::debugger::module::Module;
use std::fmt::{Display, Formatter};

/// Represent an address in the running debuggee.
/// A relocated address is a `GlobalAddress` + module base + code section offset.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct RelocatedAddress(u32);

impl RelocatedAddress {
    /// Strip module base and code section offset, yielding a DWARF-relative address.
    ///
    /// DWARF addresses in Watcom images are relative to the start of the code
    /// section, not to the image base.
    #[inline(always)]
    pub fn into_global(self, module: &Module) -> GlobalAddress {
        GlobalAddress(
            self.0
                .wrapping_sub(module.base_address)
                .wrapping_sub(module.code_section_offset),
        )
    }

    #[inline(always)]
    pub fn offset(self, offset: i32) -> RelocatedAddress {
        RelocatedAddress(self.0.wrapping_add_signed(offset))
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for RelocatedAddress {
    fn from(addr: u32) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<RelocatedAddress> for u32 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#010x}", self.0))
    }
}

/// Represent a section-relative address taken from debug information.
/// This address is unique per image file but meaningless until the image is mapped.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct GlobalAddress(u32);

impl GlobalAddress {
    /// Relocate into the address space of a mapped module, accounting for the
    /// code section offset.
    #[inline(always)]
    pub fn relocate(self, module: &Module) -> RelocatedAddress {
        RelocatedAddress(
            module
                .base_address
                .wrapping_add(module.code_section_offset)
                .wrapping_add(self.0),
        )
    }

    pub fn in_range(self, low: GlobalAddress, high: GlobalAddress) -> bool {
        self >= low && self < high
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for GlobalAddress {
    fn from(addr: u32) -> Self {
        GlobalAddress(addr)
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr as u32)
    }
}

impl From<GlobalAddress> for u32 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0
    }
}

impl From<GlobalAddress> for u64 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#010x}", self.0))
    }
}
