//! Step templating.
//!
//! A step may reference results of earlier steps of the same leg:
//!
//! * `{{header.<step>.<name>}}` – first value of a response header
//!   (case-insensitive), `{{header.<step>.<name>.<n>}}` – its n-th value;
//! * `{{body.<step>.<path>}}` – a value inside the step's JSON body, `path`
//!   being dot-separated object keys and array indices.
//!
//! Templates are parsed into segments first, so a malformed template is
//! reported as such before any lookup happens.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Response data a later step may reference
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResponse {
    pub headers: BTreeMap<String, Vec<String>>,
    /// Decoded body text
    pub body: String,
}

/// Responses of the steps executed so far, by step name
#[derive(Debug, Clone, Default)]
pub struct PriorResults {
    steps: HashMap<String, StepResponse>,
}

impl PriorResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, step: impl Into<String>, response: StepResponse) {
        self.steps.insert(step.into(), response);
    }

    pub fn get(&self, step: &str) -> Option<&StepResponse> {
        self.steps.get(step)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Header,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub raw: String,
    pub source: Source,
    pub step: String,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Placeholder(Placeholder),
}

/// Parse a template into literal and placeholder segments
pub fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            return Err(TemplateError::Malformed {
                placeholder: rest[start..].to_string(),
                reason: "missing closing }}".to_string(),
            });
        };
        let raw = &rest[start..start + OPEN.len() + end + CLOSE.len()];
        segments.push(Segment::Placeholder(parse_placeholder(raw, &after_open[..end])?));
        rest = &after_open[end + CLOSE.len()..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn parse_placeholder(raw: &str, inner: &str) -> Result<Placeholder, TemplateError> {
    let malformed = |reason: &str| TemplateError::Malformed {
        placeholder: raw.to_string(),
        reason: reason.to_string(),
    };

    let inner = inner.trim();
    if inner.contains(OPEN) {
        return Err(malformed("nested placeholder"));
    }

    let mut parts = inner.split('.');
    let source_name = parts.next().unwrap_or_default();
    let step = parts.next().ok_or_else(|| malformed("missing step name"))?;
    let path: Vec<String> = parts.map(str::to_string).collect();

    if step.is_empty() {
        return Err(malformed("empty step name"));
    }
    if path.is_empty() || path.iter().any(String::is_empty) {
        return Err(malformed("missing or empty key path"));
    }

    let source = match source_name {
        "header" => Source::Header,
        "body" => Source::Body,
        other => {
            return Err(TemplateError::UnknownSource {
                placeholder: raw.to_string(),
                source_name: other.to_string(),
            });
        }
    };

    Ok(Placeholder { raw: raw.to_string(), source, step: step.to_string(), path })
}

pub fn has_placeholders(template: &str) -> bool {
    template.contains(OPEN)
}

/// Resolve every placeholder of `template` against `prior`
pub fn render(template: &str, prior: &PriorResults) -> Result<String, TemplateError> {
    if !has_placeholders(template) {
        return Ok(template.to_string());
    }

    let mut rendered = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Placeholder(placeholder) => {
                rendered.push_str(&resolve(&placeholder, prior)?);
            }
        }
    }
    Ok(rendered)
}

fn resolve(placeholder: &Placeholder, prior: &PriorResults) -> Result<String, TemplateError> {
    let response = prior.get(&placeholder.step).ok_or_else(|| TemplateError::StepNotFound {
        placeholder: placeholder.raw.clone(),
        step: placeholder.step.clone(),
    })?;

    let value = match placeholder.source {
        Source::Header => lookup_header(&response.headers, &placeholder.path),
        Source::Body => lookup_body(&response.body, &placeholder.path),
    };

    value.ok_or_else(|| TemplateError::KeyNotFound {
        placeholder: placeholder.raw.clone(),
        step: placeholder.step.clone(),
        path: placeholder.path.join("."),
    })
}

fn find_header<'a>(
    headers: &'a BTreeMap<String, Vec<String>>,
    name: &str,
) -> Option<&'a Vec<String>> {
    headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, values)| values)
}

fn lookup_header(headers: &BTreeMap<String, Vec<String>>, path: &[String]) -> Option<String> {
    // Header names may contain dots; try the whole path as a name first.
    if let Some(values) = find_header(headers, &path.join(".")) {
        return values.first().cloned();
    }

    let (last, name) = path.split_last()?;
    let index: usize = last.parse().ok()?;
    find_header(headers, &name.join("."))?.get(index).cloned()
}

fn lookup_body(body: &str, path: &[String]) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let mut current = &json;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(match current {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prior() -> PriorResults {
        let mut prior = PriorResults::new();
        prior.insert(
            "login",
            StepResponse {
                headers: BTreeMap::from([
                    ("X-Session".to_string(), vec!["abc".to_string(), "def".to_string()]),
                    ("X.Dotted".to_string(), vec!["dot".to_string()]),
                ]),
                body: r#"{"x":"42","token":{"value":"t-1","ttl":300},"items":[{"id":7}],"ok":true}"#
                    .to_string(),
            },
        );
        prior
    }

    #[test]
    fn test_resolves_body_path() {
        let rendered = render("https://t/{{body.login.x}}", &prior()).unwrap();
        assert_eq!(rendered, "https://t/42");
    }

    #[test]
    fn test_resolves_nested_objects_arrays_and_scalars() {
        let prior = prior();
        assert_eq!(render("{{body.login.token.value}}", &prior).unwrap(), "t-1");
        assert_eq!(render("{{ body.login.token.ttl }}", &prior).unwrap(), "300");
        assert_eq!(render("{{body.login.items.0.id}}", &prior).unwrap(), "7");
        assert_eq!(render("{{body.login.ok}}", &prior).unwrap(), "true");
        assert_eq!(render("{{body.login.token}}", &prior).unwrap(), r#"{"ttl":300,"value":"t-1"}"#);
    }

    #[test]
    fn test_resolves_headers_case_insensitively() {
        let prior = prior();
        assert_eq!(render("Bearer {{header.login.x-session}}", &prior).unwrap(), "Bearer abc");
        assert_eq!(render("{{header.login.X-Session.1}}", &prior).unwrap(), "def");
        assert_eq!(render("{{header.login.X.Dotted}}", &prior).unwrap(), "dot");
    }

    #[test]
    fn test_several_placeholders_in_one_template() {
        let rendered =
            render(r#"{"id":{{body.login.items.0.id}},"s":"{{header.login.X-Session}}"}"#, &prior())
                .unwrap();
        assert_eq!(rendered, r#"{"id":7,"s":"abc"}"#);
    }

    #[test]
    fn test_unknown_step_is_step_not_found() {
        let err = render("{{body.signup.x}}", &prior()).unwrap_err();
        assert!(matches!(err, TemplateError::StepNotFound { ref step, .. } if step == "signup"));
    }

    #[test]
    fn test_missing_key_is_key_not_found() {
        let err = render("{{body.login.nope}}", &prior()).unwrap_err();
        assert!(matches!(err, TemplateError::KeyNotFound { ref path, .. } if path == "nope"));

        let err = render("{{header.login.X-Missing}}", &prior()).unwrap_err();
        assert!(matches!(err, TemplateError::KeyNotFound { .. }));

        let err = render("{{body.login.items.5.id}}", &prior()).unwrap_err();
        assert!(matches!(err, TemplateError::KeyNotFound { .. }));
    }

    #[test]
    fn test_non_json_body_is_key_not_found() {
        let mut prior = PriorResults::new();
        prior.insert("html", StepResponse { body: "<html/>".into(), ..Default::default() });
        assert!(matches!(
            render("{{body.html.title}}", &prior),
            Err(TemplateError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_templates() {
        let prior = prior();
        assert!(matches!(render("{{body.login.x", &prior), Err(TemplateError::Malformed { .. })));
        assert!(matches!(render("{{body.login}}", &prior), Err(TemplateError::Malformed { .. })));
        assert!(matches!(render("{{body..x}}", &prior), Err(TemplateError::Malformed { .. })));
        assert!(matches!(
            render("{{cookie.login.x}}", &prior),
            Err(TemplateError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_text_without_placeholders_is_untouched() {
        assert_eq!(render("plain }} text", &PriorResults::new()).unwrap(), "plain }} text");
    }
}
