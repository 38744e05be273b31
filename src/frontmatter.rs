//! YAML frontmatter codec for store markdown files.
//!
//! A file may begin with a header delimited by lines containing exactly
//! `---`. The recognized keys are `description`, `read-only`, `tags`,
//! `source`, `limit`, and `metadata`; any other key survives a
//! parse/format round-trip verbatim.
//!
//! Parsing is lenient: content without a header, or with YAML that fails to
//! parse, comes back as an empty header plus the original content. This
//! keeps out-of-band edits from ever making a file unreadable.

use serde_yaml::{Mapping, Value};

/// Parsed frontmatter header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub description: Option<String>,
    pub read_only: bool,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub limit: Option<i64>,
    /// Nested free-form mapping under the `metadata` key.
    pub metadata: Mapping,
    /// Unrecognized keys, preserved in order.
    pub extra: Mapping,
}

impl Frontmatter {
    /// True when formatting would emit no header at all.
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && !self.read_only
            && self.tags.is_empty()
            && self.source.is_none()
            && self.limit.is_none()
            && self.metadata.is_empty()
            && self.extra.is_empty()
    }
}

/// Parse content into `(header, body)`.
///
/// The returned body is a slice of the input. A single blank line
/// immediately after the closing `---` is removed once.
pub fn parse(content: &str) -> (Frontmatter, &str) {
    let Some(rest) = content.strip_prefix("---\n").or_else(|| {
        (content == "---").then_some("")
    }) else {
        return (Frontmatter::default(), content);
    };

    // Locate the closing delimiter line within the remainder.
    let mut yaml_end = None;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line == "---\n" || line == "---" {
            yaml_end = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }
    let Some((yaml_end, body_start)) = yaml_end else {
        return (Frontmatter::default(), content);
    };

    let yaml_text = &rest[..yaml_end];
    let mapping: Mapping = match serde_yaml::from_str(yaml_text) {
        Ok(Value::Mapping(m)) => m,
        Ok(Value::Null) => Mapping::new(),
        _ => return (Frontmatter::default(), content),
    };

    let mut body = &rest[body_start..];
    if let Some(stripped) = body.strip_prefix('\n') {
        body = stripped;
    }

    (from_mapping(mapping), body)
}

/// Format a header and body back into file content.
///
/// Keys with zero values are omitted; an entirely empty header emits the
/// body alone.
pub fn format(fm: &Frontmatter, body: &str) -> String {
    if fm.is_empty() {
        return body.to_string();
    }

    let mapping = to_mapping(fm);
    let yaml = serde_yaml::to_string(&Value::Mapping(mapping)).unwrap_or_default();
    format!("---\n{}---\n{}", yaml, body)
}

fn from_mapping(mapping: Mapping) -> Frontmatter {
    let mut fm = Frontmatter::default();

    for (key, value) in mapping {
        let name = key.as_str().unwrap_or_default().to_string();
        match name.as_str() {
            "description" => fm.description = value.as_str().map(str::to_string),
            "read-only" => fm.read_only = value.as_bool().unwrap_or(false),
            "tags" => {
                if let Value::Sequence(seq) = value {
                    fm.tags = seq
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            "source" => fm.source = value.as_str().map(str::to_string),
            "limit" => fm.limit = value.as_i64(),
            "metadata" => {
                if let Value::Mapping(m) = value {
                    fm.metadata = m;
                }
            }
            _ => {
                fm.extra.insert(key, value);
            }
        }
    }

    fm
}

fn to_mapping(fm: &Frontmatter) -> Mapping {
    let mut m = Mapping::new();
    if let Some(ref d) = fm.description {
        m.insert("description".into(), Value::String(d.clone()));
    }
    if fm.read_only {
        m.insert("read-only".into(), Value::Bool(true));
    }
    if !fm.tags.is_empty() {
        m.insert(
            "tags".into(),
            Value::Sequence(fm.tags.iter().map(|t| Value::String(t.clone())).collect()),
        );
    }
    if let Some(ref s) = fm.source {
        m.insert("source".into(), Value::String(s.clone()));
    }
    if let Some(l) = fm.limit {
        m.insert("limit".into(), Value::Number(l.into()));
    }
    if !fm.metadata.is_empty() {
        m.insert("metadata".into(), Value::Mapping(fm.metadata.clone()));
    }
    for (k, v) in &fm.extra {
        m.insert(k.clone(), v.clone());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_header_passthrough() {
        let (fm, body) = parse("just a note\nwith lines");
        assert!(fm.is_empty());
        assert_eq!(body, "just a note\nwith lines");
    }

    #[test]
    fn test_parse_known_keys() {
        let content = "---\ndescription: laptop specs\nread-only: true\ntags: [hw, setup]\nsource: onboarding\nlimit: 3\n---\nbody here\n";
        let (fm, body) = parse(content);
        assert_eq!(fm.description.as_deref(), Some("laptop specs"));
        assert!(fm.read_only);
        assert_eq!(fm.tags, vec!["hw", "setup"]);
        assert_eq!(fm.source.as_deref(), Some("onboarding"));
        assert_eq!(fm.limit, Some(3));
        assert_eq!(body, "body here\n");
    }

    #[test]
    fn test_blank_line_after_header_removed_once() {
        let content = "---\ndescription: d\n---\n\nbody";
        let (_, body) = parse(content);
        assert_eq!(body, "body");

        let content2 = "---\ndescription: d\n---\n\n\nbody";
        let (_, body2) = parse(content2);
        assert_eq!(body2, "\nbody");
    }

    #[test]
    fn test_malformed_yaml_is_lenient() {
        let content = "---\n: [unclosed\n---\nbody";
        let (fm, body) = parse(content);
        assert!(fm.is_empty());
        assert_eq!(body, content);
    }

    #[test]
    fn test_unclosed_header_is_lenient() {
        let content = "---\ndescription: d\nno closing line";
        let (fm, body) = parse(content);
        assert!(fm.is_empty());
        assert_eq!(body, content);
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let content = "---\ndescription: d\ncustom-key: kept\nanother: 7\n---\nbody\n";
        let (fm, body) = parse(content);
        assert_eq!(fm.extra.len(), 2);

        let rendered = format(&fm, body);
        let (fm2, body2) = parse(&rendered);
        assert_eq!(fm, fm2);
        assert_eq!(body, body2);
        assert!(rendered.contains("custom-key: kept"));
    }

    #[test]
    fn test_format_omits_zero_values() {
        let fm = Frontmatter {
            description: Some("d".into()),
            ..Default::default()
        };
        let rendered = format(&fm, "b");
        assert!(!rendered.contains("read-only"));
        assert!(!rendered.contains("tags"));
        assert!(!rendered.contains("limit"));
    }

    #[test]
    fn test_empty_header_formats_body_alone() {
        let fm = Frontmatter::default();
        assert_eq!(format(&fm, "plain body"), "plain body");
    }

    #[test]
    fn test_round_trip_with_metadata() {
        let mut metadata = Mapping::new();
        metadata.insert("origin".into(), Value::String("imported".into()));
        let fm = Frontmatter {
            description: Some("desc".into()),
            read_only: true,
            tags: vec!["a".into(), "b".into()],
            metadata,
            ..Default::default()
        };
        let rendered = format(&fm, "the body\n");
        let (parsed, body) = parse(&rendered);
        assert_eq!(parsed, fm);
        assert_eq!(body, "the body\n");
    }
}
