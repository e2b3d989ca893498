//! Template library and parameter substitution.
//!
//! Templates are canned script documents with `{{key}}` and
//! `{{key|default:value}}` placeholders. The built-in library ships as
//! embedded JSON documents; substitution is structural: the document tree
//! is walked and placeholders are replaced at string leaves. A string that
//! is exactly one placeholder is spliced with the typed parameter value, so
//! `"{{gain|default:100}}"` becomes the number `100`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Map, Value, json};

use meridian_core::Sequencer;

use crate::ScriptError;
use crate::loader::create_sequence_from_script;

/// The built-in template corpus, embedded at compile time.
const BUILT_IN_TEMPLATES: [(&str, &str); 10] = [
    (
        "imaging_sequence",
        include_str!("templates/imaging_sequence.json"),
    ),
    (
        "calibration_sequence",
        include_str!("templates/calibration_sequence.json"),
    ),
    ("focus_sequence", include_str!("templates/focus_sequence.json")),
    ("plate_solving", include_str!("templates/plate_solving.json")),
    ("device_setup", include_str!("templates/device_setup.json")),
    ("safety_check", include_str!("templates/safety_check.json")),
    (
        "script_execution",
        include_str!("templates/script_execution.json"),
    ),
    ("filter_change", include_str!("templates/filter_change.json")),
    ("guiding_setup", include_str!("templates/guiding_setup.json")),
    (
        "complete_observation",
        include_str!("templates/complete_observation.json"),
    ),
];

/// Structural validation of a template definition: a string `templateName`
/// and a `sequence` object whose targets follow the script shape.
pub fn validate_template(definition: &Value) -> bool {
    if !definition
        .get("templateName")
        .is_some_and(Value::is_string)
    {
        return false;
    }
    let Some(sequence) = definition.get("sequence").filter(|s| s.is_object()) else {
        return false;
    };
    let Some(targets) = sequence.get("targets").and_then(Value::as_array) else {
        return false;
    };
    for target in targets {
        if !target.get("name").is_some_and(Value::is_string) {
            return false;
        }
        if let Some(tasks) = target.get("tasks") {
            let Some(tasks) = tasks.as_array() else {
                return false;
            };
            for task in tasks {
                if !task.get("type").is_some_and(Value::is_string) {
                    return false;
                }
            }
        }
    }
    true
}

/// Substitute `params` into a template and return the resulting script
/// document (`{ "sequence": ... }`), ready for
/// [`create_sequence_from_script`].
pub fn apply_template(definition: &Value, params: &Value) -> Result<Value, ScriptError> {
    let sequence = definition.get("sequence").ok_or_else(|| {
        ScriptError::InvalidTemplate("missing sequence definition".to_owned())
    })?;
    let mut sequence = sequence.clone();
    let empty = Map::new();
    let params = params.as_object().unwrap_or(&empty);
    substitute_value(&mut sequence, params);
    Ok(json!({ "sequence": sequence }))
}

/// Apply a named template from `library` and replay the result onto
/// `sequencer`.
pub fn create_sequence_from_template(
    sequencer: &Sequencer,
    library: &TemplateLibrary,
    name: &str,
    params: &Value,
) -> Result<String, ScriptError> {
    let document = library.apply(name, params)?;
    create_sequence_from_script(sequencer, &document)
}

fn substitute_value(value: &mut Value, params: &Map<String, Value>) {
    match value {
        Value::String(s) => {
            if let Some(replacement) = substitute_string(s, params) {
                *value = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, params);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, params);
            }
        }
        _ => {}
    }
}

/// Substitute placeholders in one string leaf. Returns `None` when nothing
/// changed (unresolved placeholders without defaults stay as-is).
fn substitute_string(s: &str, params: &Map<String, Value>) -> Option<Value> {
    // A string that is exactly one placeholder splices the typed value.
    if let Some(inner) = s.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !inner.contains('{') && !inner.contains('}') {
            let (key, default) = split_placeholder(inner);
            if let Some(value) = params.get(key) {
                return Some(value.clone());
            }
            return default.map(parse_default);
        }
    }

    // Otherwise substitute textually inside the larger string.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    let mut changed = false;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len;
        out.push_str(&rest[..start]);
        let inner = &rest[start + 2..end];
        let (key, default) = split_placeholder(inner);
        match (params.get(key), default) {
            (Some(value), _) => {
                out.push_str(&value_to_text(value));
                changed = true;
            }
            (None, Some(default)) => {
                out.push_str(default);
                changed = true;
            }
            (None, None) => out.push_str(&rest[start..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    if !changed {
        return None;
    }
    out.push_str(rest);
    Some(Value::String(out))
}

/// Split `key|default:value` into the key and the optional default text.
fn split_placeholder(inner: &str) -> (&str, Option<&str>) {
    match inner.split_once('|') {
        Some((key, rest)) => match rest.strip_prefix("default:") {
            Some(default) => (key, Some(default)),
            None => (inner, None),
        },
        None => (inner, None),
    }
}

/// Parse a default as JSON where possible (`true`, `120`, `[..]`,
/// `"quoted"`), falling back to a bare string.
fn parse_default(default: &str) -> Value {
    serde_json::from_str(default).unwrap_or_else(|_| Value::String(default.to_owned()))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Registry of named templates, seeded with the built-in corpus.
pub struct TemplateLibrary {
    templates: RwLock<HashMap<String, Value>>,
}

impl TemplateLibrary {
    /// Create a library holding the built-in templates.
    ///
    /// # Panics
    ///
    /// Panics if an embedded template is malformed. This is a compile-time
    /// invariant -- if the crate built, the JSON is valid.
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for (name, source) in BUILT_IN_TEMPLATES {
            let definition: Value =
                serde_json::from_str(source).expect("embedded template is invalid JSON");
            debug_assert!(validate_template(&definition), "embedded template {name} invalid");
            templates.insert(name.to_owned(), definition);
        }
        Self {
            templates: RwLock::new(templates),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.templates
            .read()
            .expect("template lock poisoned")
            .get(name)
            .cloned()
    }

    /// Register a custom template after structural validation.
    pub fn register(&self, name: impl Into<String>, definition: Value) -> Result<(), ScriptError> {
        if !validate_template(&definition) {
            return Err(ScriptError::InvalidTemplate(
                "templateName and a structured sequence are required".to_owned(),
            ));
        }
        let name = name.into();
        tracing::info!(template = %name, "registered template");
        self.templates
            .write()
            .expect("template lock poisoned")
            .insert(name, definition);
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.templates
            .write()
            .expect("template lock poisoned")
            .remove(name);
    }

    /// Sorted names of every available template.
    pub fn available_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .expect("template lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Apply a named template with `params`.
    pub fn apply(&self, name: &str, params: &Value) -> Result<Value, ScriptError> {
        let definition = self
            .get(name)
            .ok_or_else(|| ScriptError::UnknownTemplate(name.to_owned()))?;
        apply_template(&definition, params)
    }

    /// Wrap an existing sequence document as a reusable template,
    /// parameterizing the conventional fields.
    pub fn create_template_from_sequence(sequence: &Value, template_name: &str) -> Value {
        let parameterized = [
            "target_name",
            "exposure_time",
            "gain",
            "binning",
            "filter",
            "count",
            "timeout",
            "device_name",
        ];
        let parameters: Map<String, Value> = parameterized
            .iter()
            .map(|field| ((*field).to_owned(), json!(format!("{{{{{field}}}}}"))))
            .collect();
        json!({
            "templateName": template_name,
            "description": "Template created from existing sequence",
            "parameters": parameters,
            "sequence": sequence,
        })
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateLibrary")
            .field("templates", &self.available_templates())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_ins_are_present_and_valid() {
        let library = TemplateLibrary::new();
        let names = library.available_templates();
        assert_eq!(names.len(), 10);
        for name in [
            "imaging_sequence",
            "calibration_sequence",
            "focus_sequence",
            "plate_solving",
            "device_setup",
            "safety_check",
            "script_execution",
            "filter_change",
            "guiding_setup",
            "complete_observation",
        ] {
            let definition = library.get(name).unwrap_or_else(|| panic!("{name} missing"));
            assert!(validate_template(&definition), "{name} failed validation");
        }
    }

    #[test]
    fn typed_splice_for_whole_placeholder() {
        let template = json!({
            "templateName": "t",
            "sequence": {
                "targets": [{"name": "{{target_name}}", "tasks": [{
                    "type": "exposure",
                    "parameters": {
                        "exposure": "{{exposure_time|default:120}}",
                        "gain": "{{gain|default:100}}",
                        "dither": "{{dither|default:true}}"
                    }
                }]}]
            }
        });
        let doc = apply_template(&template, &json!({"target_name": "m31", "gain": 250}))
            .expect("should apply");
        let params = &doc["sequence"]["targets"][0]["tasks"][0]["parameters"];
        assert_eq!(doc["sequence"]["targets"][0]["name"], json!("m31"));
        assert_eq!(params["exposure"], json!(120), "default spliced as number");
        assert_eq!(params["gain"], json!(250), "parameter wins over default");
        assert_eq!(params["dither"], json!(true), "boolean default");
    }

    #[test]
    fn textual_substitution_inside_larger_strings() {
        let template = json!({
            "templateName": "t",
            "sequence": {
                "id": "imaging_{{target_name}}",
                "targets": [{"name": "{{target_name}}"}]
            }
        });
        let doc = apply_template(&template, &json!({"target_name": "ngc7000"})).unwrap();
        assert_eq!(doc["sequence"]["id"], json!("imaging_ngc7000"));
    }

    #[test]
    fn unresolved_placeholder_without_default_is_untouched() {
        let template = json!({
            "templateName": "t",
            "sequence": {"targets": [{"name": "{{target_name}}"}]}
        });
        let doc = apply_template(&template, &json!({})).unwrap();
        assert_eq!(doc["sequence"]["targets"][0]["name"], json!("{{target_name}}"));
    }

    #[test]
    fn array_default_parses_as_json() {
        let template = json!({
            "templateName": "t",
            "sequence": {"targets": [{"name": "n", "tasks": [{
                "type": "config_task",
                "parameters": {"filters": "{{filters|default:[\"L\", \"R\"]}}"}
            }]}]}
        });
        let doc = apply_template(&template, &json!({})).unwrap();
        assert_eq!(
            doc["sequence"]["targets"][0]["tasks"][0]["parameters"]["filters"],
            json!(["L", "R"])
        );
    }

    #[test]
    fn register_rejects_invalid_definition() {
        let library = TemplateLibrary::new();
        let err = library
            .register("broken", json!({"sequence": {}}))
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidTemplate(_)));

        library
            .register(
                "custom",
                json!({"templateName": "custom", "sequence": {"targets": []}}),
            )
            .expect("valid template registers");
        assert!(library.get("custom").is_some());
        library.unregister("custom");
        assert!(library.get("custom").is_none());
    }

    #[test]
    fn unknown_template_is_an_error() {
        let library = TemplateLibrary::new();
        let err = library.apply("nope", &json!({})).unwrap_err();
        assert!(matches!(err, ScriptError::UnknownTemplate(_)));
    }

    #[test]
    fn template_from_sequence_parameterizes_conventional_fields() {
        let sequence = json!({"targets": [{"name": "m31"}]});
        let template = TemplateLibrary::create_template_from_sequence(&sequence, "mine");
        assert_eq!(template["templateName"], json!("mine"));
        assert_eq!(template["parameters"]["gain"], json!("{{gain}}"));
        assert_eq!(template["sequence"], sequence);
    }
}
