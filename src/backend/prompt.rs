/// Prompt rendering and annotation parsing shared by every adapter.
use chrono::Utc;
use serde::Deserialize;

use super::EnrichmentRequest;
use crate::error::{BackendFailure, FailureKind};
use crate::models::{ENRICHMENT_SCHEMA_VERSION, EnrichmentRecord};

/// System message sent ahead of the rendered template.
pub const SYSTEM_PROMPT: &str = "You annotate source code for a code navigation index. \
Answer with a single JSON object and nothing else.";

const DEFAULT_TEMPLATE: &str = r#"Describe the {kind} `{symbol}` defined at {path}:{lines}.

```
{code}
```

Respond with ONLY a JSON object with these keys:
  "summary": one or two sentences on what it does,
  "usage_notes": how and when callers should use it,
  "tags": short lowercase topic labels,
  "side_effects": observable effects beyond the return value (I/O, mutation, network),
  "pitfalls": mistakes callers are likely to make.
Use empty strings or empty arrays when nothing applies."#;

/// Template with `{symbol}`, `{kind}`, `{path}`, `{lines}` and `{code}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// The configured template, or the built-in one.
    pub fn from_config(template: Option<&str>) -> Self {
        template.map(Self::new).unwrap_or_default()
    }

    pub fn render(&self, request: &EnrichmentRequest) -> String {
        let lines = format!("{}-{}", request.span.start_line, request.span.end_line);
        // {code} last so placeholders inside the source text are left alone.
        self.template
            .replace("{symbol}", &request.symbol_name)
            .replace("{kind}", request.kind.as_str())
            .replace("{path}", &request.span.file_path)
            .replace("{lines}", &lines)
            .replace("{code}", &request.code)
    }
}

#[derive(Deserialize)]
struct Annotation {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    usage_notes: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    side_effects: Vec<String>,
    #[serde(default)]
    pitfalls: Vec<String>,
}

/// Turn a model answer into a record.
///
/// Models like to wrap JSON in prose or code fences, so the outermost
/// `{...}` is extracted first. A missing or empty summary is an
/// `InvalidResponse`.
pub fn parse_annotation(
    backend_id: &str,
    model_id: &str,
    span_hash: &str,
    content: &str,
) -> Result<EnrichmentRecord, BackendFailure> {
    let json_str = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => {
            return Err(BackendFailure::new(
                backend_id,
                FailureKind::InvalidResponse,
                "no JSON object in response",
            ));
        }
    };

    let annotation: Annotation = serde_json::from_str(json_str).map_err(|e| {
        BackendFailure::new(
            backend_id,
            FailureKind::InvalidResponse,
            format!("malformed annotation: {e}"),
        )
    })?;

    let summary = annotation.summary.trim();
    if summary.is_empty() {
        return Err(BackendFailure::new(
            backend_id,
            FailureKind::InvalidResponse,
            "annotation has no summary",
        ));
    }

    Ok(EnrichmentRecord {
        span_hash: span_hash.to_string(),
        summary: summary.to_string(),
        usage_notes: annotation.usage_notes.trim().to_string(),
        tags: clean(annotation.tags),
        side_effects: clean(annotation.side_effects),
        pitfalls: clean(annotation.pitfalls),
        model_id: model_id.to_string(),
        created_at: Utc::now(),
        schema_version: ENRICHMENT_SCHEMA_VERSION,
    })
}

fn clean(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, SpanIdentity};

    fn request() -> EnrichmentRequest {
        let code = "fn parse(s: &str) -> u32 { s.len() as u32 }";
        let span = SpanIdentity::compute("src/parse.rs", 10, 12, code);
        EnrichmentRequest {
            span_hash: span.span_hash(),
            span,
            symbol_name: "parse".to_string(),
            kind: EntityKind::Function,
            code: code.to_string(),
        }
    }

    #[test]
    fn test_render_default_template() {
        let prompt = PromptTemplate::default().render(&request());
        assert!(prompt.contains("function `parse`"));
        assert!(prompt.contains("src/parse.rs:10-12"));
        assert!(prompt.contains("s.len() as u32"));
    }

    #[test]
    fn test_render_leaves_placeholders_in_code() {
        let mut req = request();
        req.code = "let s = \"{symbol}\";".to_string();
        let prompt = PromptTemplate::new("{symbol}: {code}").render(&req);
        assert_eq!(prompt, "parse: let s = \"{symbol}\";");
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "Sure!\n```json\n{\"summary\": \" Parses input. \", \"tags\": [\"parsing\", \" \"]}\n```";
        let record = parse_annotation("b", "m", "hash", content).unwrap();
        assert_eq!(record.summary, "Parses input.");
        assert_eq!(record.tags, vec!["parsing"]);
        assert!(record.side_effects.is_empty());
        assert_eq!(record.model_id, "m");
        assert_eq!(record.span_hash, "hash");
        assert!(record.is_current());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for content in ["no json here", "{\"summary\": \"\"}", "{\"summary\": 42}", "} {"] {
            let err = parse_annotation("b", "m", "h", content).unwrap_err();
            assert_eq!(err.kind, FailureKind::InvalidResponse, "{content}");
        }
    }
}
