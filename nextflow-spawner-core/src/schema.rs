//! Pipeline options schema
//!
//! An [`OptionsSchema`] is the ordered list of launch options a deployment allows. It is
//! loaded once when the spawner is constructed and never mutated afterwards. Two document
//! shapes are accepted:
//!
//! - a Nextflow `nextflow_schema.json`, with parameter groups under `$defs` (or the older
//!   `defs`), each group holding `properties` and an optional `required` list;
//! - a declarative document `{"fields": [{"name": ..., "kind": ..., ...}]}` written by
//!   the deployment directly.
//!
//! # Examples
//!
//! ```rust
//! use nextflow_spawner_core::schema::{FieldKind, OptionsSchema};
//!
//! let schema = OptionsSchema::from_json_str(r#"{
//!     "fields": [
//!         {"name": "workDir", "kind": "string", "required": true},
//!         {"name": "aligner", "kind": "enum", "default": "star",
//!          "allowed_values": ["star", "hisat2"]}
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(schema.len(), 2);
//! assert_eq!(schema.field("aligner").unwrap().kind, FieldKind::Enum);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::options::OptionValue;
use crate::{Error, Result};

/// Group used for declarative fields that do not name one
pub const DEFAULT_GROUP: &str = "pipeline";

/// File name Nextflow uses for a pipeline's parameter schema
pub const SCHEMA_FILE_NAME: &str = "nextflow_schema.json";

/// Value kind of a launch option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Enum,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::String => write!(f, "string"),
            FieldKind::Integer => write!(f, "integer"),
            FieldKind::Number => write!(f, "number"),
            FieldKind::Boolean => write!(f, "boolean"),
            FieldKind::Enum => write!(f, "enum"),
        }
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Describes one launch option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    /// Kind an enum field's values are coerced to, string when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<FieldKind>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// The value names a path that must exist before launch
    #[serde(default)]
    pub must_exist: bool,
}

impl FieldDescriptor {
    /// Create a plain field in the default group
    pub fn new<S: Into<String>>(name: S, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            allowed_values: None,
            value_type: None,
            group: default_group(),
            description: None,
            help_text: None,
            hidden: false,
            format: None,
            must_exist: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn in_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_value_type(mut self, kind: FieldKind) -> Self {
        self.value_type = Some(kind);
        self
    }

    /// Kind a submitted value is coerced to once it passed the allowed-values check
    pub fn value_kind(&self) -> FieldKind {
        match (self.kind, self.value_type) {
            (FieldKind::Enum, Some(kind)) if kind != FieldKind::Enum => kind,
            (FieldKind::Enum, _) => FieldKind::String,
            (kind, _) => kind,
        }
    }

    /// Typed default, if the field declares one
    pub fn typed_default(&self) -> Option<OptionValue> {
        let default = self.default.as_ref()?;
        match OptionValue::from_default(self.kind, default)? {
            OptionValue::String(s) if self.kind == FieldKind::Enum => {
                OptionValue::parse(self.value_kind(), &s).ok()
            }
            other => Some(other),
        }
    }

    fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("schema field name cannot be empty"));
        }

        if self.kind == FieldKind::Enum
            && self.allowed_values.as_ref().map_or(true, |v| v.is_empty())
        {
            return Err(Error::configuration(format!(
                "enum field '{}' declares no allowed values",
                self.name
            )));
        }

        if let Some(default) = &self.default {
            let typed = OptionValue::from_default(self.kind, default).ok_or_else(|| {
                Error::configuration(format!(
                    "default {} of field '{}' is not a valid {}",
                    default, self.name, self.kind
                ))
            })?;

            if let (Some(allowed), OptionValue::String(s)) = (&self.allowed_values, &typed) {
                if !allowed.contains(s) {
                    return Err(Error::configuration(format!(
                        "default '{}' of field '{}' is not one of its allowed values",
                        s, self.name
                    )));
                }
            }
            if self.typed_default().is_none() {
                return Err(Error::configuration(format!(
                    "default {} of field '{}' is not a valid {}",
                    default,
                    self.name,
                    self.value_kind()
                )));
            }
        }

        if let Some(allowed) = &self.allowed_values {
            if let Some(bad) = allowed
                .iter()
                .find(|v| OptionValue::parse(self.value_kind(), v).is_err())
            {
                return Err(Error::configuration(format!(
                    "allowed value '{}' of field '{}' is not a valid {}",
                    bad,
                    self.name,
                    self.value_kind()
                )));
            }
        }

        Ok(())
    }
}

/// Ordered, immutable set of launch option descriptors
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptionsSchema {
    fields: Vec<FieldDescriptor>,
}

#[derive(Deserialize)]
struct DeclarativeSchema {
    fields: Vec<FieldDescriptor>,
}

impl OptionsSchema {
    /// Build a schema, rejecting duplicate names and defaults that do not fit their field
    pub fn new(fields: Vec<FieldDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            field.check()?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::configuration(format!(
                    "field '{}' is declared more than once",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Parse either document shape, detected by its top-level keys
    pub fn from_json_str(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text)?;
        if doc.get("$defs").is_some() || doc.get("defs").is_some() {
            Self::from_nextflow_schema(&doc)
        } else if doc.get("fields").is_some() {
            Self::from_declarative(doc)
        } else {
            Err(Error::configuration(
                "schema document has neither '$defs'/'defs' nor 'fields'",
            ))
        }
    }

    /// Read a schema document from disk
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading options schema from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read schema {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse the declarative `{"fields": [...]}` shape
    pub fn from_declarative(doc: Value) -> Result<Self> {
        let declarative: DeclarativeSchema = serde_json::from_value(doc)?;
        Self::new(declarative.fields)
    }

    /// Parse a Nextflow parameter schema.
    ///
    /// Nested `object` properties are flattened into their enclosing group.
    pub fn from_nextflow_schema(doc: &Value) -> Result<Self> {
        let groups = doc
            .get("$defs")
            .or_else(|| doc.get("defs"))
            .and_then(Value::as_object)
            .ok_or_else(|| Error::configuration("schema has no '$defs' or 'defs' section"))?;

        let mut fields = Vec::new();
        for (group, definition) in groups {
            let Some(properties) = definition.get("properties").and_then(Value::as_object) else {
                debug!("Schema group '{}' has no properties, skipping", group);
                continue;
            };
            let required = required_names(definition);
            collect_properties(group, properties, &required, &mut fields);
        }

        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields grouped by their group name, groups in first-seen order
    pub fn groups(&self) -> Vec<(&str, Vec<&FieldDescriptor>)> {
        let mut groups: Vec<(&str, Vec<&FieldDescriptor>)> = Vec::new();
        for field in &self.fields {
            match groups.iter_mut().find(|(name, _)| *name == field.group) {
                Some((_, members)) => members.push(field),
                None => groups.push((field.group.as_str(), vec![field])),
            }
        }
        groups
    }
}

fn required_names(definition: &Value) -> Vec<String> {
    definition
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn collect_properties(
    group: &str,
    properties: &Map<String, Value>,
    required: &[String],
    out: &mut Vec<FieldDescriptor>,
) {
    for (name, property) in properties {
        if property.get("type").and_then(Value::as_str) == Some("object") {
            if let Some(nested) = property.get("properties").and_then(Value::as_object) {
                let nested_required = required_names(property);
                collect_properties(group, nested, &nested_required, out);
            }
            continue;
        }
        out.push(field_from_property(
            group,
            name,
            property,
            required.iter().any(|r| r == name),
        ));
    }
}

fn field_from_property(
    group: &str,
    name: &str,
    property: &Value,
    required: bool,
) -> FieldDescriptor {
    let allowed_values: Option<Vec<String>> =
        property.get("enum").and_then(Value::as_array).map(|values| {
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        });

    let declared = match property.get("type").and_then(Value::as_str) {
        Some("integer") => FieldKind::Integer,
        Some("number") => FieldKind::Number,
        Some("boolean") => FieldKind::Boolean,
        Some("string") | None => FieldKind::String,
        Some(other) => {
            warn!(
                "Schema field '{}' has unsupported type '{}', treating it as a string",
                name, other
            );
            FieldKind::String
        }
    };
    let (kind, value_type) = match (&allowed_values, declared) {
        (Some(_), FieldKind::String) => (FieldKind::Enum, None),
        (Some(_), base) => (FieldKind::Enum, Some(base)),
        (None, kind) => (kind, None),
    };

    // Blank string defaults mean "no default" in practice
    let default = property.get("default").cloned().filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    });

    let text = |key: &str| property.get(key).and_then(Value::as_str).map(str::to_string);

    FieldDescriptor {
        name: name.to_string(),
        kind,
        default,
        required,
        allowed_values,
        value_type,
        group: group.to_string(),
        description: text("description"),
        help_text: text("help_text"),
        hidden: property
            .get("hidden")
            .map(|v| v.as_bool().unwrap_or(true))
            .unwrap_or(false),
        format: text("format"),
        must_exist: property
            .get("exists")
            .map(|v| v.as_bool().unwrap_or(true))
            .unwrap_or(false),
    }
}

/// Where Nextflow keeps the schema of a pulled pipeline:
/// `<nxf_home>/assets/<repository path>/nextflow_schema.json`
pub fn schema_asset_path(nxf_home: &Path, workflow_url: &str) -> PathBuf {
    let repository = match url::Url::parse(workflow_url) {
        Ok(url) => url.path().trim_matches('/').to_string(),
        // Short `owner/repo` form
        Err(_) => workflow_url.trim_matches('/').to_string(),
    };
    let repository = repository
        .strip_suffix(".git")
        .unwrap_or(&repository)
        .to_string();

    nxf_home
        .join("assets")
        .join(repository)
        .join(SCHEMA_FILE_NAME)
}
