//! Address and location resolution scenarios, exercised through the public
//! API with hand-built line caches (no live debuggee required).

use std::path::PathBuf;
use wcdbg::debugger::address::GlobalAddress;
use wcdbg::debugger::breakpoint::BreakpointLocation;
use wcdbg::debugger::module::Module;
use wcdbg::dwarf::line::{LineCache, SourceLocation};

fn smackw32() -> Module {
    Module {
        name: "smackw32.dll".to_string(),
        base_address: 0x001d_0000,
        path: PathBuf::from("c:\\entomorph\\smackw32.dll"),
        size: 0,
        code_section_offset: 0x1000,
        debug_info: None,
    }
}

fn trampolines_cache() -> LineCache {
    LineCache::new(vec![
        SourceLocation {
            file: PathBuf::from("trampolines.cpp"),
            line: 10,
            column: 1,
            address: GlobalAddress::from(0x2966u32),
        },
        SourceLocation {
            file: PathBuf::from("trampolines.cpp"),
            line: 258,
            column: 1,
            address: GlobalAddress::from(0x2ac6u32),
        },
    ])
}

#[test]
fn test_section_offset_resolution_fixture() {
    // DLL at base 0x001d0000, code section at +0x1000: the row for
    // trampolines.cpp:10 must land on absolute 0x001d3966.
    let module = smackw32();
    let cache = trampolines_cache();

    let relative = cache.line_to_address("trampolines.cpp", 10).unwrap();
    let absolute = relative.relocate(&module);
    assert_eq!(u32::from(absolute), 0x001d_3966);

    // Inverse query: the absolute address maps back to trampolines.cpp:10.
    let place = cache.address_to_line(absolute.into_global(&module)).unwrap();
    assert_eq!(place.line, 10);
    assert_eq!(place.file, PathBuf::from("trampolines.cpp"));
}

#[test]
fn test_line_row_round_trip_for_all_rows() {
    let module = smackw32();
    let cache = trampolines_cache();

    for (line, relative) in [(10u64, 0x2966u32), (258, 0x2ac6)] {
        let absolute = GlobalAddress::from(relative).relocate(&module);
        let place = cache.address_to_line(absolute.into_global(&module)).unwrap();
        assert_eq!(place.line, line);
    }
}

#[test]
fn test_address_between_rows_resolves_to_previous_line() {
    let cache = trampolines_cache();
    let place = cache.address_to_line(GlobalAddress::from(0x2a00u32)).unwrap();
    assert_eq!(place.line, 10);
}

#[test]
fn test_address_below_first_row_is_unresolved() {
    let cache = trampolines_cache();
    assert!(cache.address_to_line(GlobalAddress::from(0x100u32)).is_none());
}

#[test]
fn test_file_matching_accepts_basename_and_case_variants() {
    let cache = LineCache::new(vec![SourceLocation {
        file: PathBuf::from("C:\\dev\\smack\\trampolines.cpp"),
        line: 10,
        column: 1,
        address: GlobalAddress::from(0x2966u32),
    }]);

    assert!(cache
        .line_to_address("C:\\dev\\smack\\trampolines.cpp", 10)
        .is_some());
    assert!(cache.line_to_address("trampolines.cpp", 10).is_some());
    assert!(cache.line_to_address("TRAMPOLINES.CPP", 10).is_some());
    assert!(cache.line_to_address("trampolines.cpp", 11).is_none());
}

#[test]
fn test_location_grammar_shapes() {
    assert_eq!(
        BreakpointLocation::parse("0x001d3966").unwrap(),
        BreakpointLocation::Address(0x001d_3966.into())
    );
    assert_eq!(
        BreakpointLocation::parse("smackw32.dll:100").unwrap(),
        BreakpointLocation::ModuleOffset {
            module: "smackw32.dll".to_string(),
            offset: 0x100,
        }
    );
    assert_eq!(
        BreakpointLocation::parse("plague.EXE:0x2340f").unwrap(),
        BreakpointLocation::ModuleOffset {
            module: "plague.EXE".to_string(),
            offset: 0x2340f,
        }
    );
    assert_eq!(
        BreakpointLocation::parse("smack.c:45").unwrap(),
        BreakpointLocation::Line {
            file: "smack.c".to_string(),
            line: 45,
        }
    );
    assert!(BreakpointLocation::parse("").is_err());
    assert!(BreakpointLocation::parse("smack.c").is_err());
    assert!(BreakpointLocation::parse("smack.c:").is_err());
}

#[test]
fn test_module_offset_convention_skips_section_offset() {
    // The module:offset form is image-relative: base + offset, while source
    // line resolution adds the code section offset on top of the base. The
    // same numeric offset therefore lands 0x1000 apart.
    let module = smackw32();

    let from_offset = module.base_address + 0x3966;
    let from_line = GlobalAddress::from(0x3966u32).relocate(&module);
    assert_eq!(from_offset, 0x001d_3966);
    assert_eq!(u32::from(from_line), 0x001d_4966);
}
