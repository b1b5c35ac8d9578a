//! wcdbg: a source-level debugger for 32-bit Windows PE executables built
//! with the Watcom C/C++ toolchain.
//!
//! Watcom embeds DWARF 2 debug information either in `.debug_*` PE sections
//! or as an ELF container appended to the PE file. The crate drives a
//! debuggee through the native debug-event interface, patches software
//! breakpoints, and resolves addresses to source lines and local variables.
//!
//! The Win32 surface is gated behind `cfg(windows)`; the DWARF pipeline,
//! breakpoint engine and event-dispatch policy are host independent.

pub mod cfg;
pub mod debugger;
pub mod dwarf;
pub mod session;
