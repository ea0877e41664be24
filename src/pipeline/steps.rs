// Generic built-in steps usable from any stage's `steps` property.

use crate::config::pipeline::{
    CopyFieldParams, DiscardParams, RemoveFieldsParams, SetStaticFieldParams, StepConfig,
};
use crate::data_model::{lookup_path, Document};
use crate::error::{PipelineError, Result};
use crate::executor::ProcessingStep;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, info_span, instrument, warn};

fn split(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Creates intermediate maps as needed. Fails if a non-map is in the way.
fn set(root: &mut Map<String, Value>, path: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry.as_object_mut().ok_or_else(|| PipelineError::ProcessError {
            step_name: "set".to_string(),
            message: format!("'{}' is not a map", segment),
        })?;
    }
    current.insert(last.clone(), value);
    Ok(())
}

fn remove(root: &mut Map<String, Value>, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = root;
    for segment in parents {
        current = current.get_mut(segment)?.as_object_mut()?;
    }
    current.remove(last)
}

pub struct SetStaticField {
    params: SetStaticFieldParams,
}

impl SetStaticField {
    pub fn new(params: SetStaticFieldParams) -> Self {
        SetStaticField { params }
    }
}

#[async_trait]
impl ProcessingStep for SetStaticField {
    fn name(&self) -> &'static str {
        "SetStaticField"
    }

    async fn process(&self, mut document: Document) -> Result<Document> {
        let path = split(&self.params.field);
        if !self.params.overwrite && lookup_path(&document.contents, &path).is_some() {
            return Ok(document);
        }
        set(&mut document.contents, &path, self.params.value.clone()).map_err(|e| {
            PipelineError::ProcessError {
                step_name: self.name().to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(document)
    }
}

pub struct RemoveFields {
    params: RemoveFieldsParams,
}

impl RemoveFields {
    pub fn new(params: RemoveFieldsParams) -> Self {
        RemoveFields { params }
    }
}

#[async_trait]
impl ProcessingStep for RemoveFields {
    fn name(&self) -> &'static str {
        "RemoveFields"
    }

    async fn process(&self, mut document: Document) -> Result<Document> {
        for field in &self.params.fields {
            if remove(&mut document.contents, &split(field)).is_none() {
                debug!(doc_id = %document.id, field = %field, "Field not present, nothing to remove");
            }
        }
        Ok(document)
    }
}

pub struct CopyField {
    params: CopyFieldParams,
}

impl CopyField {
    pub fn new(params: CopyFieldParams) -> Self {
        CopyField { params }
    }
}

#[async_trait]
impl ProcessingStep for CopyField {
    fn name(&self) -> &'static str {
        "CopyField"
    }

    async fn process(&self, mut document: Document) -> Result<Document> {
        let Some(value) = lookup_path(&document.contents, &split(&self.params.from)).cloned() else {
            return Err(PipelineError::ProcessError {
                step_name: self.name().to_string(),
                message: format!("source field '{}' missing", self.params.from),
            });
        };
        set(&mut document.contents, &split(&self.params.to), value).map_err(|e| {
            PipelineError::ProcessError {
                step_name: self.name().to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(document)
    }
}

pub struct Discard {
    params: DiscardParams,
}

impl Discard {
    pub fn new(params: DiscardParams) -> Self {
        Discard { params }
    }
}

#[async_trait]
impl ProcessingStep for Discard {
    fn name(&self) -> &'static str {
        "Discard"
    }

    async fn process(&self, document: Document) -> Result<Document> {
        let hit = match &self.params.field {
            Some(field) => lookup_path(&document.contents, &split(field)).is_some(),
            None => true,
        };
        if !hit {
            return Ok(document);
        }
        let reason = self
            .params
            .reason
            .clone()
            .unwrap_or_else(|| "discarded by configuration".to_string());
        Err(PipelineError::DocumentFiltered {
            document: Box::new(document),
            reason,
        })
    }
}

/// Builds the step list of a stage from its configuration.
#[instrument(skip(configs), fields(num_steps = configs.len()))]
pub fn build_steps_from_config(configs: &[StepConfig]) -> Result<Vec<Box<dyn ProcessingStep>>> {
    let mut steps: Vec<Box<dyn ProcessingStep>> = Vec::new();

    for (i, step_config) in configs.iter().enumerate() {
        let step_span = info_span!("pipeline_step", index = i, type = step_config.name());
        let _enter = step_span.enter();
        step_config.validate()?;

        let step: Box<dyn ProcessingStep> = match step_config {
            StepConfig::SetStaticField(params) => {
                debug!(params = ?params, "Adding SetStaticField");
                Box::new(SetStaticField::new(params.clone()))
            }
            StepConfig::RemoveFields(params) => {
                debug!(params = ?params, "Adding RemoveFields");
                Box::new(RemoveFields::new(params.clone()))
            }
            StepConfig::CopyField(params) => {
                debug!(params = ?params, "Adding CopyField");
                Box::new(CopyField::new(params.clone()))
            }
            StepConfig::Discard(params) => {
                debug!(params = ?params, "Adding Discard");
                Box::new(Discard::new(params.clone()))
            }
        };
        steps.push(step);
    }

    if steps.is_empty() {
        warn!("Stage has no processing steps; documents will be committed unchanged.");
    } else {
        info!("Built {} processing steps.", steps.len());
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).with_id("d")
    }

    #[tokio::test]
    async fn test_set_static_field_nested() {
        let step = SetStaticField::new(SetStaticFieldParams {
            field: "meta.lang".to_string(),
            value: json!("en"),
            overwrite: false,
        });
        let out = step.process(doc(json!({"a": 1}))).await.unwrap();
        assert_eq!(out.contents["meta"]["lang"], json!("en"));

        let kept = step
            .process(doc(json!({"meta": {"lang": "da"}})))
            .await
            .unwrap();
        assert_eq!(kept.contents["meta"]["lang"], json!("da"));
    }

    #[tokio::test]
    async fn test_set_through_scalar_fails() {
        let step = SetStaticField::new(SetStaticFieldParams {
            field: "a.b".to_string(),
            value: json!(1),
            overwrite: true,
        });
        match step.process(doc(json!({"a": 5}))).await {
            Err(PipelineError::ProcessError { step_name, .. }) => assert_eq!(step_name, "SetStaticField"),
            other => panic!("Expected ProcessError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_and_remove() {
        let copy = CopyField::new(CopyFieldParams {
            from: "title".to_string(),
            to: "search.title".to_string(),
        });
        let remove = RemoveFields::new(RemoveFieldsParams {
            fields: vec!["title".to_string(), "nope".to_string()],
        });
        let out = copy.process(doc(json!({"title": "x"}))).await.unwrap();
        let out = remove.process(out).await.unwrap();
        assert_eq!(out.contents, json!({"search": {"title": "x"}}).as_object().cloned().unwrap());
        assert!(copy.process(doc(json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_nested_paths_resolve_like_queries() {
        let copy = CopyField::new(CopyFieldParams {
            from: "source.feed.name".to_string(),
            to: "feed".to_string(),
        });
        let document = doc(json!({"source": {"feed": {"name": "rss"}}}));
        let path = split("source.feed.name");
        assert_eq!(
            lookup_path(&document.contents, &path),
            document.content_field(&path)
        );
        let out = copy.process(document).await.unwrap();
        assert_eq!(out.contents["feed"], json!("rss"));
        // A scalar in the middle of the path is a miss, not a match.
        assert!(copy
            .process(doc(json!({"source": {"feed": "rss"}})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_discard_only_when_field_present() {
        let step = Discard::new(DiscardParams {
            field: Some("spam".to_string()),
            reason: None,
        });
        assert!(step.process(doc(json!({"ok": 1}))).await.is_ok());
        match step.process(doc(json!({"spam": true}))).await {
            Err(PipelineError::DocumentFiltered { document, reason }) => {
                assert_eq!(document.id, "d");
                assert_eq!(reason, "discarded by configuration");
            }
            other => panic!("Expected DocumentFiltered, got {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_invalid() {
        let configs = vec![StepConfig::CopyField(CopyFieldParams {
            from: "a".to_string(),
            to: "a".to_string(),
        })];
        assert!(build_steps_from_config(&configs).is_err());
    }
}
