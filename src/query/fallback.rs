/// Live text search over a working tree, used when the graph cannot be
/// trusted. Honors `.gitignore`, skips binary and oversized files.
use std::io;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, trace};

use super::graph::Direction;
use crate::config::QueryConfig;
use crate::models::normalize_path;

/// Keywords that introduce a definition in the languages we are likely to
/// meet. Used to tell definition sites apart from usages.
const DEFINITION_KEYWORDS: &str =
    r"fn|def|class|struct|enum|trait|type|interface|func|function|const|let|var|impl|mod";

const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMatch {
    pub file_path: String,
    pub line: usize,
    pub text: String,
}

pub struct FallbackSearcher {
    max_file_bytes: u64,
    exclude: GlobSet,
}

impl FallbackSearcher {
    pub fn new(max_file_bytes: u64, exclude: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            max_file_bytes,
            exclude: builder.build()?,
        })
    }

    pub fn from_config(config: &QueryConfig) -> Result<Self, globset::Error> {
        Self::new(config.max_fallback_file_bytes, &config.fallback_exclude)
    }

    /// Case-insensitive literal search.
    pub fn search(&self, root: &Path, query: &str, limit: usize) -> io::Result<Vec<TextMatch>> {
        let pattern = RegexBuilder::new(&regex::escape(query.trim()))
            .case_insensitive(true)
            .build()
            .map_err(invalid_pattern)?;
        self.scan(root, limit, |line| pattern.is_match(line))
    }

    /// Lines mentioning `symbol` as a whole word, excluding its definitions.
    pub fn where_used(&self, root: &Path, symbol: &str, limit: usize) -> io::Result<Vec<TextMatch>> {
        let (usage, definition) = symbol_patterns(symbol)?;
        self.scan(root, limit, |line| usage.is_match(line) && !definition.is_match(line))
    }

    /// One-level approximation of a lineage walk: upstream yields usage
    /// sites, downstream yields the definition sites the body hangs off.
    pub fn lineage(
        &self,
        root: &Path,
        symbol: &str,
        direction: Direction,
        max_results: usize,
    ) -> io::Result<Vec<TextMatch>> {
        match direction {
            Direction::Upstream => self.where_used(root, symbol, max_results),
            Direction::Downstream => {
                let (_, definition) = symbol_patterns(symbol)?;
                self.scan(root, max_results, |line| definition.is_match(line))
            }
        }
    }

    fn scan(
        &self,
        root: &Path,
        limit: usize,
        matches: impl Fn(&str) -> bool,
    ) -> io::Result<Vec<TextMatch>> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("repository root not found: {}", root.display()),
            ));
        }

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut results = Vec::new();
        let mut files_scanned = 0usize;

        for entry in walker.filter_map(|e| e.ok()) {
            if results.len() >= limit {
                break;
            }
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            let rel = match path.strip_prefix(root) {
                Ok(rel) => normalize_path(&rel.to_string_lossy()),
                Err(_) => continue,
            };
            if self.exclude.is_match(&rel) {
                continue;
            }

            let Some(content) = self.read_text(path) else {
                continue;
            };
            files_scanned += 1;

            for (idx, line) in content.lines().enumerate() {
                if matches(line) {
                    results.push(TextMatch {
                        file_path: rel.clone(),
                        line: idx + 1,
                        text: line.trim().to_string(),
                    });
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }

        debug!(
            root = %root.display(),
            files = files_scanned,
            matches = results.len(),
            "Fallback scan finished"
        );
        Ok(results)
    }

    fn read_text(&self, path: &Path) -> Option<String> {
        let meta = std::fs::metadata(path).ok()?;
        if meta.len() > self.max_file_bytes {
            trace!(path = %path.display(), bytes = meta.len(), "Skipping oversized file");
            return None;
        }
        let bytes = std::fs::read(path).ok()?;
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            trace!(path = %path.display(), "Skipping binary file");
            return None;
        }
        String::from_utf8(bytes).ok()
    }
}

fn symbol_patterns(symbol: &str) -> io::Result<(Regex, Regex)> {
    let escaped = regex::escape(symbol.trim());
    let usage = Regex::new(&format!(r"\b{escaped}\b")).map_err(invalid_pattern)?;
    let definition =
        Regex::new(&format!(r"\b(?:{DEFINITION_KEYWORDS})\s+{escaped}\b")).map_err(invalid_pattern)?;
    Ok((usage, definition))
}

fn invalid_pattern(e: regex::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        write(
            root,
            "src/lib.rs",
            b"pub fn foo() -> u32 {\n    42\n}\n\npub fn bar() -> u32 {\n    foo() + 1\n}\n",
        );
        write(root, "src/main.rs", b"fn main() {\n    let x = lib::foo();\n    let food = 1;\n}\n");
        write(root, "target/debug/out.rs", b"foo()\n");
        write(root, "assets/logo.bin", b"foo\0\0\0");
        write(root, "ignored/gen.rs", b"foo()\n");
        write(root, ".gitignore", b"ignored/\n");
        temp
    }

    fn searcher() -> FallbackSearcher {
        FallbackSearcher::from_config(&QueryConfig::default()).unwrap()
    }

    #[test]
    fn test_search_case_insensitive() {
        let temp = fixture();
        let hits = searcher().search(temp.path(), "FOO", 100).unwrap();
        let files: Vec<(&str, usize)> = hits.iter().map(|h| (h.file_path.as_str(), h.line)).collect();
        assert_eq!(
            files,
            vec![("src/lib.rs", 1), ("src/lib.rs", 6), ("src/main.rs", 2), ("src/main.rs", 3)]
        );
        assert_eq!(hits[0].text, "pub fn foo() -> u32 {");
    }

    #[test]
    fn test_where_used_skips_definitions() {
        let temp = fixture();
        let hits = searcher().where_used(temp.path(), "foo", 100).unwrap();
        let files: Vec<(&str, usize)> = hits.iter().map(|h| (h.file_path.as_str(), h.line)).collect();
        assert_eq!(files, vec![("src/lib.rs", 6), ("src/main.rs", 2)]);
    }

    #[test]
    fn test_lineage_fallback() {
        let temp = fixture();
        let s = searcher();
        let down = s.lineage(temp.path(), "foo", Direction::Downstream, 10).unwrap();
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].line, 1);
        let up = s.lineage(temp.path(), "foo", Direction::Upstream, 1).unwrap();
        assert_eq!(up.len(), 1);
    }

    #[test]
    fn test_limit_and_size_cap() {
        let temp = fixture();
        assert_eq!(searcher().search(temp.path(), "foo", 2).unwrap().len(), 2);

        let tiny = FallbackSearcher::new(8, &[]).unwrap();
        assert!(tiny.search(temp.path(), "foo", 100).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = searcher()
            .search(&temp.path().join("nope"), "foo", 10)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_bad_glob_rejected() {
        assert!(FallbackSearcher::new(1024, &["a/[".to_string()]).is_err());
    }
}
