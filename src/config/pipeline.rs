use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A single built-in processing step, as declared under a stage's `steps` property.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum StepConfig {
    SetStaticField(SetStaticFieldParams),
    RemoveFields(RemoveFieldsParams),
    CopyField(CopyFieldParams),
    Discard(DiscardParams),
}

impl StepConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StepConfig::SetStaticField(_) => "SetStaticField",
            StepConfig::RemoveFields(_) => "RemoveFields",
            StepConfig::CopyField(_) => "CopyField",
            StepConfig::Discard(_) => "Discard",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StepConfig::SetStaticField(params) => params.validate(),
            StepConfig::RemoveFields(params) => params.validate(),
            StepConfig::CopyField(params) => params.validate(),
            StepConfig::Discard(params) => params.validate(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn check_field(step: &str, what: &str, field: &str) -> Result<()> {
    if field.is_empty() || field.split('.').any(|s| s.is_empty()) {
        return Err(PipelineError::ConfigValidationError(format!(
            "{}: {} must be a non-empty dotted path, got '{}'",
            step, what, field
        )));
    }
    Ok(())
}

/// Writes a fixed value into a content field.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SetStaticFieldParams {
    pub field: String,
    pub value: Value,
    #[serde(default = "default_true")]
    pub overwrite: bool,
}

impl SetStaticFieldParams {
    pub fn validate(&self) -> Result<()> {
        check_field("SetStaticFieldParams", "field", &self.field)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RemoveFieldsParams {
    pub fields: Vec<String>,
}

impl RemoveFieldsParams {
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(PipelineError::ConfigValidationError(
                "RemoveFieldsParams: fields must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            check_field("RemoveFieldsParams", "fields entry", field)?;
            if !seen.insert(field) {
                return Err(PipelineError::ConfigValidationError(format!(
                    "RemoveFieldsParams: duplicate field '{}'",
                    field
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CopyFieldParams {
    pub from: String,
    pub to: String,
}

impl CopyFieldParams {
    pub fn validate(&self) -> Result<()> {
        check_field("CopyFieldParams", "from", &self.from)?;
        check_field("CopyFieldParams", "to", &self.to)?;
        if self.from == self.to {
            return Err(PipelineError::ConfigValidationError(format!(
                "CopyFieldParams: from and to must differ, both are '{}'",
                self.from
            )));
        }
        Ok(())
    }
}

/// Discards documents that carry `field` (or every document when unset).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DiscardParams {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl DiscardParams {
    pub fn validate(&self) -> Result<()> {
        if let Some(field) = &self.field {
            check_field("DiscardParams", "field", field)?;
        }
        Ok(())
    }
}

/// Loads and validates a pipeline definition from a YAML file.
pub fn load_pipeline_definition<P: AsRef<Path>>(path: P) -> Result<Pipeline> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read pipeline definition file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    let pipeline: Pipeline = serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse pipeline definition YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    pipeline.validate()?;
    Ok(pipeline)
}
