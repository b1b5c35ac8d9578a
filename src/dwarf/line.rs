use crate::debugger::address::GlobalAddress;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// A source place produced by the line number program.
/// The address is section-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u64,
    pub column: u64,
    pub address: GlobalAddress,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}:{}:{}",
            self.file.display(),
            self.line,
            self.column
        ))
    }
}

/// Bidirectional address <-> (file, line) lookup caches for one module.
pub struct LineCache {
    address_to_line: BTreeMap<GlobalAddress, SourceLocation>,
    line_to_address: HashMap<(PathBuf, u64), GlobalAddress>,
}

impl LineCache {
    pub fn new(rows: Vec<SourceLocation>) -> Self {
        let mut address_to_line = BTreeMap::new();
        let mut line_to_address: HashMap<(PathBuf, u64), GlobalAddress> = HashMap::new();

        for row in rows {
            // A line maps to its first address.
            let key = (row.file.clone(), row.line);
            if row.line != 0 {
                let entry = line_to_address.entry(key).or_insert(row.address);
                if row.address < *entry {
                    *entry = row.address;
                }
            }
            address_to_line.insert(row.address, row);
        }

        Self {
            address_to_line,
            line_to_address,
        }
    }

    /// Resolve an address to a source place: exact row if present, otherwise
    /// the closest row at a lower address. Addresses below the first cached
    /// row resolve to nothing.
    pub fn address_to_line(&self, address: GlobalAddress) -> Option<&SourceLocation> {
        self.address_to_line
            .range(..=address)
            .next_back()
            .map(|(_, loc)| loc)
    }

    /// Resolve a (file, line) pair to the first address of the line.
    /// File matching accepts an exact path, a basename, or case-insensitive
    /// forms of either (the debuggee comes from a case-insensitive file system).
    pub fn line_to_address(&self, file: &str, line: u64) -> Option<GlobalAddress> {
        if let Some(addr) = self.line_to_address.get(&(PathBuf::from(file), line)) {
            return Some(*addr);
        }

        let wanted_basename = basename_of(file);
        for ((cached_file, cached_line), addr) in &self.line_to_address {
            if *cached_line == line && basename_of(&cached_file.to_string_lossy()) == wanted_basename
            {
                return Some(*addr);
            }
        }

        let wanted_lower = file.to_lowercase();
        let wanted_basename_lower = wanted_basename.to_lowercase();
        for ((cached_file, cached_line), addr) in &self.line_to_address {
            if *cached_line != line {
                continue;
            }
            let cached_str = cached_file.to_string_lossy();
            if cached_str.to_lowercase() == wanted_lower
                || basename_of(&cached_str).to_lowercase() == wanted_basename_lower
            {
                return Some(*addr);
            }
        }

        None
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        let mut files: Vec<&Path> = self
            .address_to_line
            .values()
            .map(|loc| loc.file.as_path())
            .collect();
        files.sort();
        files.dedup();
        files.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.address_to_line.is_empty()
    }
}

fn basename_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(file: &str, line: u64, addr: u32) -> SourceLocation {
        SourceLocation {
            file: PathBuf::from(file),
            line,
            column: 1,
            address: addr.into(),
        }
    }

    fn cache() -> LineCache {
        LineCache::new(vec![
            row("C:\\src\\trampolines.cpp", 10, 0x3966),
            row("C:\\src\\trampolines.cpp", 11, 0x3970),
            row("C:\\src\\smack.c", 45, 0x1200),
            row("C:\\src\\smack.c", 45, 0x1210),
        ])
    }

    #[test]
    fn test_address_to_line_exact_and_closest() {
        let cache = cache();
        assert_eq!(
            cache.address_to_line(0x3966u32.into()).unwrap().line,
            10,
            "exact row"
        );
        assert_eq!(
            cache.address_to_line(0x396au32.into()).unwrap().line,
            10,
            "closest row below"
        );
        assert_eq!(cache.address_to_line(0x3970u32.into()).unwrap().line, 11);
    }

    #[test]
    fn test_address_below_smallest_row_resolves_to_nothing() {
        let cache = cache();
        assert!(cache.address_to_line(0x100u32.into()).is_none());
    }

    #[test]
    fn test_line_to_address_returns_first_address() {
        let cache = cache();
        assert_eq!(
            cache.line_to_address("C:\\src\\smack.c", 45),
            Some(0x1200u32.into())
        );
    }

    #[test]
    fn test_line_to_address_matches_basename_and_case() {
        let cache = cache();
        assert_eq!(
            cache.line_to_address("trampolines.cpp", 10),
            Some(0x3966u32.into())
        );
        assert_eq!(
            cache.line_to_address("TRAMPOLINES.CPP", 10),
            Some(0x3966u32.into())
        );
        assert_eq!(cache.line_to_address("unrelated.c", 10), None);
    }

    #[test]
    fn test_line_round_trip() {
        let cache = cache();
        let addr = cache.line_to_address("trampolines.cpp", 10).unwrap();
        let place = cache.address_to_line(addr).unwrap();
        assert_eq!(place.line, 10);
        assert_eq!(
            place.file.file_name().unwrap().to_string_lossy(),
            "trampolines.cpp"
        );
    }
}
