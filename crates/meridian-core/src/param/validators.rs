//! Reusable parameter predicates.
//!
//! Free functions suitable for [`ParamSpec::with_validator`] closures and
//! cross-field checks. Each returns `Err(message)` naming the offending
//! parameter.
//!
//! [`ParamSpec::with_validator`]: super::ParamSpec::with_validator

use serde_json::Value;

/// The value must be a number within `[min, max]`.
pub fn number_in_range(value: &Value, name: &str, min: f64, max: f64) -> Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Err(format!("{name} must be a number"));
    };
    if n < min || n > max {
        return Err(format!("{name} must be between {min} and {max}"));
    }
    Ok(())
}

/// The value must be a number greater than zero.
pub fn positive(value: &Value, name: &str) -> Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Err(format!("{name} must be a number"));
    };
    if n <= 0.0 {
        return Err(format!("{name} must be positive"));
    }
    Ok(())
}

/// The value must be a number of at least zero.
pub fn non_negative(value: &Value, name: &str) -> Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Err(format!("{name} must be a number"));
    };
    if n < 0.0 {
        return Err(format!("{name} must be non-negative"));
    }
    Ok(())
}

/// The value must be a non-empty string.
pub fn non_empty_string(value: &Value, name: &str) -> Result<(), String> {
    let Some(s) = value.as_str() else {
        return Err(format!("{name} must be a string"));
    };
    if s.is_empty() {
        return Err(format!("{name} must not be empty"));
    }
    Ok(())
}

/// The value must equal one of `allowed`.
pub fn one_of(value: &Value, name: &str, allowed: &[Value]) -> Result<(), String> {
    if allowed.contains(value) {
        Ok(())
    } else {
        Err(format!("{name} has an invalid value"))
    }
}

/// Cross-field: if `present` exists in the document, `required` must too.
pub fn requires(doc: &Value, present: &str, required: &str) -> Result<(), String> {
    let has = |key: &str| doc.get(key).is_some_and(|v| !v.is_null());
    if has(present) && !has(required) {
        return Err(format!("{present} requires {required}"));
    }
    Ok(())
}
