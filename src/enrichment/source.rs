/// Reads span text from the working tree and checks it still matches the
/// indexed content hash.
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::trace;

use crate::models::{SpanIdentity, span_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanSource {
    /// Text matches the indexed hash.
    Verified(String),
    /// File edited since indexing; the span identity is stale.
    Changed,
    /// File missing, unreadable, or shorter than the span.
    Unavailable,
}

/// Per-run cache of file contents, keyed by repository-relative path.
pub struct SourceReader {
    root: PathBuf,
    files: HashMap<String, Option<String>>,
}

impl SourceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: HashMap::new(),
        }
    }

    pub async fn load(&mut self, span: &SpanIdentity) -> SpanSource {
        if !self.files.contains_key(&span.file_path) {
            let path = self.root.join(&span.file_path);
            let content = tokio::fs::read_to_string(&path).await.ok();
            if content.is_none() {
                trace!(path = %path.display(), "Span source unreadable");
            }
            self.files.insert(span.file_path.clone(), content);
        }

        let Some(Some(content)) = self.files.get(&span.file_path) else {
            return SpanSource::Unavailable;
        };
        let Some(text) = span_text(content, span.start_line, span.end_line) else {
            return SpanSource::Unavailable;
        };

        let current = SpanIdentity::compute(&span.file_path, span.start_line, span.end_line, &text);
        if current.content_hash == span.content_hash {
            SpanSource::Verified(text)
        } else {
            SpanSource::Changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_span_source() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(
            temp.path().join("src/lib.rs"),
            "use std::io;\n\nfn answer() -> u32 {\n    42\n}\n",
        )
        .unwrap();

        let mut reader = SourceReader::new(temp.path());
        let good = SpanIdentity::compute("src/lib.rs", 3, 5, "fn answer() -> u32 {\n    42\n}");
        let stale = SpanIdentity::compute("src/lib.rs", 3, 5, "fn answer() -> u32 {\n    41\n}");
        let beyond = SpanIdentity::compute("src/lib.rs", 3, 50, "x");
        let missing = SpanIdentity::compute("src/gone.rs", 1, 1, "x");

        assert_eq!(
            reader.load(&good).await,
            SpanSource::Verified("fn answer() -> u32 {\n    42\n}".to_string())
        );
        assert_eq!(reader.load(&stale).await, SpanSource::Changed);
        assert_eq!(reader.load(&beyond).await, SpanSource::Unavailable);
        assert_eq!(reader.load(&missing).await, SpanSource::Unavailable);
    }
}
