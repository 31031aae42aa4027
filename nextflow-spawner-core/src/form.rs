//! Schema-driven options form description
//!
//! The hub renders whatever widgets it likes; this module only decides what the form
//! contains. Hidden fields are left out, and a group whose fields are all hidden does not
//! get a section.

use serde::{Deserialize, Serialize};

use crate::schema::{FieldDescriptor, FieldKind, OptionsSchema};

/// Input widget a field should be rendered with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Number,
    Checkbox,
    Select { options: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub input: InputKind,
    pub default: Option<String>,
    pub help_text: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSection {
    pub group: String,
    pub title: String,
    pub fields: Vec<FormField>,
}

/// Complete description of the options form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDescription {
    pub sections: Vec<FormSection>,
}

impl FormDescription {
    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter())
            .find(|f| f.name == name)
    }

    pub fn field_count(&self) -> usize {
        self.sections.iter().map(|s| s.fields.len()).sum()
    }
}

/// Turn a schema into a form description
pub fn render_options_form(schema: &OptionsSchema) -> FormDescription {
    let sections = schema
        .groups()
        .into_iter()
        .filter_map(|(group, fields)| {
            let fields: Vec<FormField> = fields
                .into_iter()
                .filter(|f| !f.hidden)
                .map(form_field)
                .collect();
            if fields.is_empty() {
                return None;
            }
            Some(FormSection {
                group: group.to_string(),
                title: format!("{} options", group),
                fields,
            })
        })
        .collect();

    FormDescription { sections }
}

fn form_field(field: &FieldDescriptor) -> FormField {
    let input = match (field.kind, &field.allowed_values) {
        (_, Some(options)) => InputKind::Select {
            options: options.clone(),
        },
        (FieldKind::Integer | FieldKind::Number, None) => InputKind::Number,
        (FieldKind::Boolean, None) => InputKind::Checkbox,
        _ => InputKind::Text,
    };

    FormField {
        name: field.name.clone(),
        label: field
            .description
            .clone()
            .unwrap_or_else(|| field.name.clone()),
        input,
        default: field
            .typed_default()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string()),
        help_text: field.help_text.clone(),
        required: field.required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use serde_json::json;

    fn schema() -> OptionsSchema {
        let mut hidden = FieldDescriptor::new("monochrome_logs", FieldKind::Boolean)
            .with_default(json!(false))
            .in_group("generic");
        hidden.hidden = true;

        let mut outdir = FieldDescriptor::new("outdir", FieldKind::String)
            .with_default(json!("results"))
            .required()
            .in_group("input_output");
        outdir.description = Some("Output directory".to_string());
        outdir.help_text = Some("Relative to the launch directory".to_string());

        OptionsSchema::new(vec![
            outdir,
            FieldDescriptor::new("max_cpus", FieldKind::Integer)
                .with_default(json!(4))
                .in_group("resources"),
            FieldDescriptor::new("skip_qc", FieldKind::Boolean)
                .with_default(json!(true))
                .in_group("resources"),
            FieldDescriptor::new("aligner", FieldKind::Enum)
                .with_allowed_values(["star", "hisat2"])
                .in_group("resources"),
            hidden,
        ])
        .unwrap()
    }

    #[test]
    fn test_sections_follow_groups() {
        let form = render_options_form(&schema());

        let titles: Vec<&str> = form.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["input_output options", "resources options"]);
        assert_eq!(form.field_count(), 4);
    }

    #[test]
    fn test_hidden_only_group_has_no_section() {
        let form = render_options_form(&schema());
        assert!(form.sections.iter().all(|s| s.group != "generic"));
        assert!(form.field("monochrome_logs").is_none());
    }

    #[test]
    fn test_field_widgets() {
        let form = render_options_form(&schema());

        let outdir = form.field("outdir").unwrap();
        assert_eq!(outdir.input, InputKind::Text);
        assert_eq!(outdir.label, "Output directory");
        assert_eq!(outdir.default.as_deref(), Some("results"));
        assert!(outdir.required);
        assert!(outdir.help_text.is_some());

        assert_eq!(form.field("max_cpus").unwrap().input, InputKind::Number);
        assert_eq!(form.field("max_cpus").unwrap().default.as_deref(), Some("4"));
        assert_eq!(form.field("skip_qc").unwrap().input, InputKind::Checkbox);

        let aligner = form.field("aligner").unwrap();
        assert_eq!(aligner.label, "aligner");
        assert_eq!(
            aligner.input,
            InputKind::Select {
                options: vec!["star".to_string(), "hisat2".to_string()]
            }
        );
        assert!(aligner.default.is_none());
    }

    #[test]
    fn test_serializes_input_kind_tag() {
        let value = serde_json::to_value(InputKind::Select {
            options: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(value, json!({"type": "select", "options": ["a"]}));
        assert_eq!(serde_json::to_value(InputKind::Text).unwrap(), json!({"type": "text"}));
    }
}
