//! Validation of submitted form values against an [`OptionsSchema`]
//!
//! [`validate`] is a pure function: every failing field is reported in one pass so the
//! form can be shown again with all problems at once. [`check_paths`] is the separate,
//! filesystem-touching pass for fields that name paths which must exist.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{ValidationError, ValidationErrors};
use crate::options::{LaunchOptions, OptionValue};
use crate::schema::{FieldKind, OptionsSchema};

/// Validate raw form input and apply schema defaults.
///
/// The result holds exactly the schema's fields. Optional fields without a value or a
/// default are present as [`OptionValue::Null`]. Raw keys the schema does not declare
/// are ignored.
pub fn validate(
    schema: &OptionsSchema,
    raw_input: &HashMap<String, String>,
) -> Result<LaunchOptions, ValidationErrors> {
    let mut options = LaunchOptions::default();
    let mut errors = ValidationErrors::new();

    for field in schema.fields() {
        let raw = raw_input
            .get(&field.name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());

        let value = match raw {
            Some(raw) => {
                if let Some(allowed) = &field.allowed_values {
                    if !allowed.iter().any(|a| a == raw) {
                        errors.push(ValidationError::new(
                            &field.name,
                            format!("'{}' is not one of: {}", raw, allowed.join(", ")),
                        ));
                        continue;
                    }
                }
                match OptionValue::parse(field.value_kind(), raw) {
                    Ok(value) => value,
                    Err(reason) => {
                        errors.push(ValidationError::new(&field.name, reason));
                        continue;
                    }
                }
            }
            None => match field.typed_default().filter(|v| !v.is_null()) {
                Some(default) => default,
                None if field.required => {
                    errors.push(ValidationError::new(&field.name, "missing required value"));
                    continue;
                }
                None => OptionValue::Null,
            },
        };

        options.insert(field.name.clone(), value);
    }

    for key in raw_input.keys() {
        if schema.field(key).is_none() {
            debug!("Ignoring form key '{}' that is not part of the schema", key);
        }
    }

    errors.into_result().map(|_| options)
}

/// Check that every `must_exist` field names something on disk.
///
/// A final path component containing `*` or `?` is matched against the entries of its
/// parent directory.
pub fn check_paths(
    schema: &OptionsSchema,
    options: &LaunchOptions,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    for field in schema.fields().iter().filter(|f| f.must_exist) {
        let Some(value) = options.get(&field.name).and_then(OptionValue::as_str) else {
            continue;
        };
        if field.value_kind() != FieldKind::String {
            continue;
        }
        if let Err(reason) = check_path(value) {
            errors.push(ValidationError::new(&field.name, reason));
        }
    }

    errors.into_result()
}

fn check_path(value: &str) -> Result<(), String> {
    let path = Path::new(value);
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if contains_wildcard(file_name) {
        let entries = fs::read_dir(parent)
            .map_err(|_| format!("{} is not readable", parent.display()))?;
        let matched = entries
            .flatten()
            .any(|entry| entry.file_name().to_str().is_some_and(|n| wildcard_match(file_name, n)));
        return if matched {
            Ok(())
        } else {
            Err(format!("{} does not exist", value))
        };
    }

    let metadata = fs::metadata(path).map_err(|_| format!("{} does not exist", value))?;
    let readable = if metadata.is_dir() {
        fs::read_dir(path).is_ok()
    } else {
        fs::File::open(path).is_ok()
    };
    if readable {
        Ok(())
    } else {
        Err(format!("{} is not readable", value))
    }
}

fn contains_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Shell-style match supporting `*` and `?`
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_input = 0;

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_input = i;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_input += 1;
            i = star_input;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
