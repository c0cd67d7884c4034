//! Attribute values, cross-resource references, and string templates
//!
//! A declared property is a tree of [`Value`]s. Leaves are either literals or
//! [`Reference`]s to another resource's outputs; strings that embed
//! references become [`Value::Template`]s. The graph builder finds edges by
//! matching on these variants rather than by inspecting strings.
//!
//! Placeholder syntax inside declared strings:
//!
//! - `"${db.status.address}"` - the whole string is a typed reference
//! - `"${lb.status.ingress[0].ip ?? \"pending\"}"` - reference with a
//!   fallback used when the field is absent or null
//! - `"http://${lb.status.ingress[0].ip}/"` - a template rendered to a string
//! - `"echo $${HOME}"` - `$${` is a literal `${`, no reference

use crate::error::{ParseError, ResolveError};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Start of a placeholder (`${`) or of an escaped literal (`$${`)
static OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$?\{").expect("placeholder pattern is valid"));

const ESCAPED_OPENER: &str = "$${";

/// Length of a placeholder body up to its closing `}`.
///
/// Braces inside JSON string literals and balanced `{...}` pairs (an object
/// fallback) do not close the placeholder.
fn body_len(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (pos, c) in rest.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' if depth == 0 => return Some(pos),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Write literal text back in declared form.
fn escape_text(text: &str) -> String {
    text.replace("${", ESCAPED_OPENER)
}

// ============================================================================
// Field paths
// ============================================================================

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

/// A path into a JSON document, e.g. `status.loadBalancer.ingress[0].ip`.
///
/// The empty path addresses the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// The path addressing the whole document.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path with optional `[n]` index suffixes.
    pub fn parse(path: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        if path.is_empty() {
            return Ok(Self { segments });
        }

        for part in path.split('.') {
            if part.is_empty() {
                return Err(format!("empty segment in path '{path}'"));
            }

            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(format!("unexpected text '{rest}' in path '{path}'"));
                }
                let Some(close) = rest.find(']') else {
                    return Err(format!("unclosed '[' in path '{path}'"));
                };
                let index = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index '{}' in path '{path}'", &rest[1..close]))?;
                segments.push(PathSegment::Index(index));
                rest = &rest[close + 1..];
            }
        }

        Ok(Self { segments })
    }

    /// Whether this path addresses the whole document.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path's segments in order.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Follow the path into `value`.
    pub fn lookup<'a>(&self, value: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match segment {
                PathSegment::Key(key) => current.get(key.as_str()),
                PathSegment::Index(index) => current.get(*index),
            })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// References
// ============================================================================

/// A reference to a field of another resource's outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// Logical name of the producing resource
    pub resource: String,
    /// Path into the producer's outputs
    pub path: FieldPath,
    /// Literal used when the field is absent or null
    pub fallback: Option<serde_json::Value>,
}

impl Reference {
    /// Reference a field of `resource`'s outputs.
    pub fn new(resource: impl Into<String>, path: FieldPath) -> Self {
        Self {
            resource: resource.into(),
            path,
            fallback: None,
        }
    }

    /// Use `fallback` when the referenced field is missing.
    pub fn with_fallback(mut self, fallback: impl Into<serde_json::Value>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Parse a placeholder body: `resource[.path][ ?? fallback]`.
    ///
    /// The fallback is read as JSON; anything that is not valid JSON is
    /// taken as a bare string.
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidReference {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let (target, fallback) = match expr.split_once("??") {
            Some((target, fallback)) => {
                let fallback = fallback.trim();
                if fallback.is_empty() {
                    return Err(invalid("empty fallback after '??'"));
                }
                let value = serde_json::from_str(fallback)
                    .unwrap_or_else(|_| serde_json::Value::String(fallback.to_string()));
                (target.trim(), Some(value))
            }
            None => (expr.trim(), None),
        };

        let split = target.find(['.', '[']).unwrap_or(target.len());
        let resource = &target[..split];
        if resource.is_empty() {
            return Err(invalid("missing resource name"));
        }
        if resource.chars().any(char::is_whitespace) {
            return Err(invalid("resource name contains whitespace"));
        }

        let path = target[split..].strip_prefix('.').unwrap_or(&target[split..]);
        let path = FieldPath::parse(path).map_err(|reason| invalid(&reason))?;

        Ok(Self {
            resource: resource.to_string(),
            path,
            fallback,
        })
    }

    /// Pick the referenced field out of the producer's outputs.
    pub fn extract(&self, outputs: &serde_json::Value) -> Result<serde_json::Value, ResolveError> {
        match self.path.lookup(outputs) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            found => match (&self.fallback, found) {
                (Some(fallback), _) => Ok(fallback.clone()),
                (None, Some(null)) => Ok(null.clone()),
                (None, None) => Err(ResolveError::MissingField {
                    reference: self.to_string(),
                }),
            },
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}", self.resource)?;
        if !self.path.is_root() {
            if matches!(self.path.segments().first(), Some(PathSegment::Key(_))) {
                f.write_str(".")?;
            }
            write!(f, "{}", self.path)?;
        }
        if let Some(fallback) = &self.fallback {
            write!(f, " ?? {fallback}")?;
        }
        f.write_str("}")
    }
}

// ============================================================================
// Values
// ============================================================================

/// A piece of a string template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text
    Text(String),
    /// A reference rendered into the string
    Reference(Reference),
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A JSON scalar (null, bool, number, string)
    Literal(serde_json::Value),
    /// An ordered list
    List(Vec<Value>),
    /// A nested structure
    Map(BTreeMap<String, Value>),
    /// A typed reference to another resource's output
    Reference(Reference),
    /// A string interpolating one or more references
    Template(Vec<Segment>),
}

impl Value {
    /// Wrap a JSON value without interpreting placeholders.
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        match value.into() {
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::literal).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Self::literal(value)))
                    .collect(),
            ),
            scalar => Self::Literal(scalar),
        }
    }

    /// Convert a declared JSON tree, turning `${...}` placeholders into references.
    pub fn parse(value: serde_json::Value) -> Result<Self, ParseError> {
        match value {
            serde_json::Value::String(s) => Self::parse_str(&s),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Self::parse)
                .collect::<Result<_, _>>()
                .map(Self::List),
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| Self::parse(value).map(|value| (key, value)))
                .collect::<Result<_, _>>()
                .map(Self::Map),
            scalar => Ok(Self::Literal(scalar)),
        }
    }

    /// Parse a single declared string.
    pub fn parse_str(s: &str) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = s;

        while let Some(opener) = OPENER.find(rest) {
            text.push_str(&rest[..opener.start()]);
            let after = &rest[opener.end()..];
            if opener.as_str() == ESCAPED_OPENER {
                text.push_str("${");
                rest = after;
                continue;
            }

            let Some(len) = body_len(after) else {
                return Err(ParseError::InvalidReference {
                    expr: after.to_string(),
                    reason: "unclosed placeholder".to_string(),
                });
            };
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Reference(Reference::parse(&after[..len])?));
            rest = &after[len + 1..];
        }
        text.push_str(rest);

        if segments.is_empty() {
            return Ok(Self::Literal(serde_json::Value::String(text)));
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        if let [Segment::Reference(reference)] = segments.as_slice() {
            return Ok(Self::Reference(reference.clone()));
        }
        Ok(Self::Template(segments))
    }

    /// Every reference in this value, depth-first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(found)),
            Self::Reference(reference) => found.push(reference),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Reference(reference) = segment {
                        found.push(reference);
                    }
                }
            }
        }
    }

    /// Whether the value contains no references.
    pub fn is_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// Substitute every reference using `lookup`, producing plain JSON.
    pub fn resolve<F>(&self, lookup: &mut F) -> Result<serde_json::Value, ResolveError>
    where
        F: FnMut(&Reference) -> Result<serde_json::Value, ResolveError>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<_, _>>()
                .map(serde_json::Value::Array),
            Self::Map(map) => {
                let mut resolved = serde_json::Map::new();
                for (key, value) in map {
                    resolved.insert(key.clone(), value.resolve(lookup)?);
                }
                Ok(serde_json::Value::Object(resolved))
            }
            Self::Reference(reference) => lookup(reference),
            Self::Template(segments) => {
                let mut rendered = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => rendered.push_str(text),
                        Segment::Reference(reference) => {
                            rendered.push_str(&render_fragment(&lookup(reference)?));
                        }
                    }
                }
                Ok(serde_json::Value::String(rendered))
            }
        }
    }

    /// The value as declared, with references written back as `${...}` strings
    /// and literal `${` escaped.
    pub fn to_declared_json(&self) -> serde_json::Value {
        match self {
            Self::Literal(serde_json::Value::String(text)) => {
                serde_json::Value::String(escape_text(text))
            }
            Self::Literal(value) => value.clone(),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_declared_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_declared_json()))
                    .collect(),
            ),
            Self::Reference(reference) => serde_json::Value::String(reference.to_string()),
            Self::Template(segments) => serde_json::Value::String(
                segments
                    .iter()
                    .map(|segment| match segment {
                        Segment::Text(text) => escape_text(text),
                        Segment::Reference(reference) => reference.to_string(),
                    })
                    .collect(),
            ),
        }
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

/// Render a resolved value into template text.
///
/// Strings are inserted raw, null renders empty, everything else as JSON.
pub fn render_fragment(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_path_parse_and_display() {
        let path = FieldPath::parse("status.loadBalancer.ingress[0].ip").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("status".into()),
                PathSegment::Key("loadBalancer".into()),
                PathSegment::Key("ingress".into()),
                PathSegment::Index(0),
                PathSegment::Key("ip".into()),
            ]
        );
        assert_eq!(path.to_string(), "status.loadBalancer.ingress[0].ip");
        assert!(FieldPath::parse("").unwrap().is_root());
    }

    #[test]
    fn test_field_path_rejects_garbage() {
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("a[x]").is_err());
        assert!(FieldPath::parse("a[0").is_err());
    }

    #[test]
    fn test_field_path_lookup() {
        let doc = json!({"spec": {"ports": [{"port": 8000}]}});
        let path = FieldPath::parse("spec.ports[0].port").unwrap();
        assert_eq!(path.lookup(&doc), Some(&json!(8000)));
        let missing = FieldPath::parse("spec.ports[3].port").unwrap();
        assert_eq!(missing.lookup(&doc), None);
        assert_eq!(FieldPath::root().lookup(&doc), Some(&doc));
    }

    #[test]
    fn test_reference_parse_with_fallback() {
        let reference =
            Reference::parse("istio-gateway-lb.status.loadBalancer.ingress[0].ip ?? \"pending\"")
                .unwrap();
        assert_eq!(reference.resource, "istio-gateway-lb");
        assert_eq!(
            reference.path.to_string(),
            "status.loadBalancer.ingress[0].ip"
        );
        assert_eq!(reference.fallback, Some(json!("pending")));

        let bare = Reference::parse("svc.port ?? unknown").unwrap();
        assert_eq!(bare.fallback, Some(json!("unknown")));
    }

    #[test]
    fn test_reference_parse_errors() {
        assert!(Reference::parse(".x").is_err());
        assert!(Reference::parse("a b.c").is_err());
        assert!(Reference::parse("svc.port ??").is_err());
    }

    #[test]
    fn test_reference_display_round_trips() {
        let text = "lb.status.ingress[0].ip ?? \"pending\"";
        let reference = Reference::parse(text).unwrap();
        assert_eq!(reference.to_string(), format!("${{{text}}}"));
        assert_eq!(Reference::parse("ns").unwrap().to_string(), "${ns}");
    }

    #[test]
    fn test_reference_extract_uses_fallback_for_null_and_missing() {
        let reference = Reference::parse("lb.status.ip ?? \"pending\"").unwrap();
        assert_eq!(
            reference.extract(&json!({"status": {}})).unwrap(),
            json!("pending")
        );
        assert_eq!(
            reference.extract(&json!({"status": {"ip": null}})).unwrap(),
            json!("pending")
        );
        assert_eq!(
            reference
                .extract(&json!({"status": {"ip": "10.0.0.1"}}))
                .unwrap(),
            json!("10.0.0.1")
        );

        let strict = Reference::parse("lb.status.ip").unwrap();
        assert!(matches!(
            strict.extract(&json!({})),
            Err(ResolveError::MissingField { .. })
        ));
    }

    #[test]
    fn test_parse_str_variants() {
        assert_eq!(
            Value::parse_str("plain").unwrap(),
            Value::Literal(json!("plain"))
        );
        assert!(matches!(
            Value::parse_str("${svc.metadata.name}").unwrap(),
            Value::Reference(_)
        ));
        match Value::parse_str("http://${lb.ip}:${lb.port}/").unwrap() {
            Value::Template(segments) => assert_eq!(segments.len(), 5),
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_escaped_opener_is_literal_text() {
        let value = Value::parse(json!({"env": {"GREETING": "hello $${USER}"}})).unwrap();
        assert!(value.is_literal());
        let mut no_lookup = |_: &Reference| -> Result<serde_json::Value, ResolveError> {
            unreachable!("literal values have no references")
        };
        assert_eq!(
            value.resolve(&mut no_lookup).unwrap(),
            json!({"env": {"GREETING": "hello ${USER}"}})
        );

        match Value::parse_str("$${HOME}/${cfg.dir}").unwrap() {
            Value::Template(segments) => {
                assert_eq!(segments[0], Segment::Text("${HOME}/".into()));
                assert!(matches!(&segments[1], Segment::Reference(r) if r.resource == "cfg"));
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_may_contain_braces() {
        let Value::Reference(reference) = Value::parse_str(r#"${a.b ?? "{}"}"#).unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(reference.fallback, Some(json!("{}")));

        let Value::Reference(object) = Value::parse_str(r#"${a.b ?? {"x": "}"}}"#).unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(object.fallback, Some(json!({"x": "}"})));

        match Value::parse_str(r#"[${a.b ?? "{"}]"#).unwrap() {
            Value::Template(segments) => {
                assert_eq!(segments.len(), 3);
                assert_eq!(segments[2], Segment::Text("]".into()));
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_unclosed_placeholder_rejected() {
        assert!(Value::parse_str("${a.b").is_err());
        assert!(Value::parse_str(r#"${a.b ?? "}"#).is_err());
        assert!(Value::parse_str("cost: $${").is_ok());
    }

    #[test]
    fn test_parse_tree_collects_references() {
        let value = Value::parse(json!({
            "namespace": "${demo.metadata.name}",
            "backendRefs": [{"name": "${httpbin-service.metadata.name}", "port": 8000}],
            "note": "plain"
        }))
        .unwrap();

        let refs: Vec<_> = value.references().iter().map(|r| r.resource.clone()).collect();
        assert_eq!(refs, vec!["httpbin-service", "demo"]);
        assert!(!value.is_literal());
        assert!(Value::literal(json!({"a": [1, 2]})).is_literal());
    }

    #[test]
    fn test_resolve_substitutes_references_and_templates() {
        let value = Value::parse(json!({
            "port": "${svc.spec.ports[0].port}",
            "url": "http://${svc.metadata.name}:${svc.spec.ports[0].port}/"
        }))
        .unwrap();
        let outputs = json!({"metadata": {"name": "httpbin"}, "spec": {"ports": [{"port": 8000}]}});

        let resolved = value
            .resolve(&mut |reference: &Reference| reference.extract(&outputs))
            .unwrap();
        assert_eq!(
            resolved,
            json!({"port": 8000, "url": "http://httpbin:8000/"})
        );
    }

    #[test]
    fn test_to_declared_json_restores_placeholders() {
        let declared = json!({
            "ns": "${demo.metadata.name}",
            "n": 2,
            "t": "x-${a}",
            "shell": "echo $${USER}",
            "mixed": "$${HOME}/${cfg.dir}",
            "braces": "${a.b ?? \"{}\"}"
        });
        let value = Value::parse(declared.clone()).unwrap();
        assert_eq!(value.to_declared_json(), declared);
    }
}
