//! Typed parameter schema and validation.
//!
//! Each task type carries an ordered list of [`ParamSpec`] entries plus
//! optional named cross-field validators. Validation collects every error in
//! one pass rather than stopping at the first.

pub mod validators;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Predicate over a single parameter value. Returns `Err(message)` on
/// rejection.
pub type ValueValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Predicate over the full parameter document, for constraints that span
/// fields (e.g. "offset requires limit").
pub type DocumentValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// JSON type tag a parameter value must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    /// Any whole JSON number.
    Integer,
    /// Any JSON number.
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Whether `value` matches this type tag.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => {
                value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "array" => Ok(Self::Array),
            "object" => Ok(Self::Object),
            other => Err(format!("invalid parameter type {other:?}")),
        }
    }
}

/// Schema entry for one parameter.
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
    pub validator: Option<ValueValidator>,
}

impl ParamSpec {
    /// A required parameter with no default.
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            description: String::new(),
            validator: None,
        }
    }

    /// An optional parameter, defaulting to `default` when absent.
    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        default: impl Into<Option<Value>>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: default.into(),
            description: String::new(),
            validator: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Ordered parameter schema for a task type.
#[derive(Clone, Default)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
    cross_validators: Vec<(String, DocumentValidator)>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter definition. Later definitions with the same name
    /// replace earlier ones.
    pub fn add(&mut self, spec: ParamSpec) {
        if let Some(existing) = self.specs.iter_mut().find(|s| s.name == spec.name) {
            *existing = spec;
        } else {
            self.specs.push(spec);
        }
    }

    /// Register a named validator over the whole parameter document.
    pub fn add_cross_validator(
        &mut self,
        name: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.cross_validators
            .push((name.into(), Arc::new(validator)));
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty() && self.cross_validators.is_empty()
    }

    /// Validate `params` against the schema, collecting every error.
    ///
    /// Absent optional parameters with a default are validated at the
    /// default value. Cross-field validators run against the document with
    /// defaults merged in.
    pub fn validate(&self, params: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let empty = Map::new();
        let map = params.as_object().unwrap_or(&empty);

        for spec in &self.specs {
            let present = map.get(&spec.name).filter(|v| !v.is_null());
            let effective = present.or(spec.default.as_ref());

            let Some(value) = effective else {
                if spec.required {
                    errors.push(format!("missing required parameter: {}", spec.name));
                }
                continue;
            };

            if !spec.param_type.matches(value) {
                errors.push(format!("{} must be a {}", spec.name, spec.param_type));
                continue;
            }

            if let Some(validator) = &spec.validator {
                if let Err(msg) = validator(value) {
                    errors.push(msg);
                }
            }
        }

        if !self.cross_validators.is_empty() {
            let merged = self.apply_defaults(params);
            for (name, validator) in &self.cross_validators {
                if let Err(msg) = validator(&merged) {
                    errors.push(format!("{name}: {msg}"));
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Return a copy of `params` with schema defaults merged in for absent
    /// or null optional parameters.
    pub fn apply_defaults(&self, params: &Value) -> Value {
        let mut map = params.as_object().cloned().unwrap_or_default();
        for spec in &self.specs {
            let absent = map.get(&spec.name).is_none_or(Value::is_null);
            if absent {
                if let Some(default) = &spec.default {
                    map.insert(spec.name.clone(), default.clone());
                }
            }
        }
        Value::Object(map)
    }
}

impl fmt::Debug for ParamSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSchema")
            .field("specs", &self.specs)
            .field(
                "cross_validators",
                &self
                    .cross_validators
                    .iter()
                    .map(|(n, _)| n)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
