use crate::session::proto::{SourceExcerpt, SourceLine};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Loads and caches the user's source text for get-source requests.
///
/// DWARF records compile-time paths; the files usually live elsewhere on the
/// debugging machine, so lookups fall back to configured source directories
/// by basename.
#[derive(Default)]
pub struct SourceResolver {
    cache: HashMap<String, Vec<String>>,
    directories: Vec<PathBuf>,
}

impl SourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directory(&mut self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        if directory.is_dir() {
            self.directories.push(directory);
        }
    }

    fn load(&mut self, file: &str) -> Option<&Vec<String>> {
        if !self.cache.contains_key(file) {
            let lines = self.read_lines(file)?;
            self.cache.insert(file.to_string(), lines);
        }
        self.cache.get(file)
    }

    fn read_lines(&self, file: &str) -> Option<Vec<String>> {
        let mut candidates = vec![PathBuf::from(file)];
        if let Some(basename) = Path::new(file).file_name() {
            for dir in &self.directories {
                candidates.push(dir.join(basename));
            }
        }

        for candidate in candidates {
            if let Ok(text) = fs::read_to_string(&candidate) {
                return Some(text.lines().map(|l| l.to_string()).collect());
            }
        }
        None
    }

    /// Lines around `line` with `context` lines before and after; the
    /// requested line is flagged.
    pub fn source_lines(&mut self, file: &str, line: u64, context: u64) -> Option<SourceExcerpt> {
        let start = line.saturating_sub(context).max(1);
        let end = line + context;
        let mut excerpt = self.source_range(file, start, end)?;
        for entry in &mut excerpt.lines {
            entry.is_current = entry.line_number == line;
        }
        Some(excerpt)
    }

    /// An inclusive 1-based line range.
    pub fn source_range(&mut self, file: &str, start: u64, end: u64) -> Option<SourceExcerpt> {
        let lines = self.load(file)?;
        let total = lines.len() as u64;
        let start = start.max(1);
        let end = end.min(total);

        let mut out = vec![];
        for number in start..=end {
            out.push(SourceLine {
                line_number: number,
                content: lines[(number - 1) as usize].clone(),
                is_current: false,
            });
        }

        Some(SourceExcerpt {
            file: Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.to_string()),
            full_path: file.to_string(),
            lines: out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn temp_source(tag: &str, content: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("wcdbg_src_{}_{tag}.c", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_source_lines_with_context_and_current_flag() {
        let path = temp_source("ctx", "int a;\nint b;\nint c;\nint d;\nint e;\n");
        let mut resolver = SourceResolver::new();

        let excerpt = resolver
            .source_lines(path.to_str().unwrap(), 3, 1)
            .unwrap();
        assert_eq!(excerpt.lines.len(), 3);
        assert_eq!(excerpt.lines[0].line_number, 2);
        assert!(excerpt.lines[1].is_current);
        assert_eq!(excerpt.lines[1].content, "int c;");

        fs::remove_file(path).ok();
    }

    #[test]
    #[serial]
    fn test_directory_fallback_by_basename() {
        let dir = std::env::temp_dir().join(format!("wcdbg_dir_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("smack.c"), "line one\n").unwrap();

        let mut resolver = SourceResolver::new();
        resolver.add_directory(&dir);

        // The compile-time path does not exist here; the basename lookup does.
        let excerpt = resolver.source_lines("C:\\build\\smack.c", 1, 0).unwrap();
        assert_eq!(excerpt.lines[0].content, "line one");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_file_is_none() {
        let mut resolver = SourceResolver::new();
        assert!(resolver.source_lines("no_such_file.c", 1, 2).is_none());
    }

    #[test]
    #[serial]
    fn test_range_clamped_to_file_bounds() {
        let path = temp_source("clamp", "a\nb\n");
        let mut resolver = SourceResolver::new();
        let excerpt = resolver
            .source_range(path.to_str().unwrap(), 1, 99)
            .unwrap();
        assert_eq!(excerpt.lines.len(), 2);
        fs::remove_file(path).ok();
    }
}
