// Pipeline model: stages, their groups and deployment modes.

pub mod settings;
pub mod steps;

use crate::error::{PipelineError, Result};
use crate::store::artifacts::is_valid_artifact_id;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

pub use settings::StageSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageMode {
    #[default]
    Active,
    /// Scheduled with relaxed guarantees: debug logging, no restarts, ignored for archival.
    Debug,
    /// Never scheduled.
    Inactive,
}

impl StageMode {
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, StageMode::Inactive)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Content-addressed id of the stage's packaged executable, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Stage {
            name: name.into(),
            artifact_ref: None,
            mode: StageMode::Active,
            properties: Map::new(),
        }
    }

    pub fn with_mode(mut self, mode: StageMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    /// Output stages consume DELETE actions.
    pub fn is_output(&self) -> bool {
        self.properties
            .get("output")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageGroup {
    pub name: String,
    /// Overrides the supervisor's restart budget for every stage in the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl StageGroup {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        StageGroup {
            name: name.into(),
            max_restarts: None,
            stages,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    /// Bumped by the store on every save.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub groups: Vec<StageGroup>,
}

/// Stage-level changes between two deployments, by stage name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl PipelineDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, groups: Vec<StageGroup>) -> Self {
        Pipeline {
            name: name.into(),
            version: 0,
            groups,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidPipeline(
                "pipeline name must not be empty".to_string(),
            ));
        }
        let mut groups = HashSet::new();
        let mut stages = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(PipelineError::InvalidPipeline(
                    "group name must not be empty".to_string(),
                ));
            }
            if !groups.insert(group.name.as_str()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
            for stage in &group.stages {
                if stage.name.trim().is_empty() || stage.name.trim() != stage.name {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "invalid stage name '{}' in group '{}'",
                        stage.name, group.name
                    )));
                }
                if !stages.insert(stage.name.as_str()) {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "duplicate stage name '{}'",
                        stage.name
                    )));
                }
                if let Some(artifact) = &stage.artifact_ref {
                    if !is_valid_artifact_id(artifact) {
                        return Err(PipelineError::InvalidPipeline(format!(
                            "stage '{}' has invalid artifact reference '{}'",
                            stage.name, artifact
                        )));
                    }
                }
                if stage.mode.is_scheduled() {
                    StageSettings::from_properties(&stage.properties).map_err(|e| {
                        PipelineError::InvalidPipeline(format!(
                            "stage '{}' has invalid properties: {}",
                            stage.name, e
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.groups.iter().flat_map(|g| g.stages.iter())
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages().find(|s| s.name == name)
    }

    pub fn group_of(&self, stage: &str) -> Option<&StageGroup> {
        self.groups
            .iter()
            .find(|g| g.stages.iter().any(|s| s.name == stage))
    }

    /// ACTIVE and DEBUG stages, with their owning group, in declaration order.
    pub fn scheduled_stages(&self) -> impl Iterator<Item = (&StageGroup, &Stage)> {
        self.groups
            .iter()
            .flat_map(|g| g.stages.iter().map(move |s| (g, s)))
            .filter(|(_, s)| s.mode.is_scheduled())
    }

    pub fn active_stage_names(&self) -> BTreeSet<String> {
        self.stages()
            .filter(|s| s.mode == StageMode::Active)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn output_stage_names(&self) -> BTreeSet<String> {
        self.stages()
            .filter(|s| s.mode.is_scheduled() && s.is_output())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Compares the scheduled stages of `self` (currently deployed) against `next`.
    pub fn diff(&self, next: &Pipeline) -> PipelineDiff {
        let mut diff = PipelineDiff::default();
        for (group, stage) in next.scheduled_stages() {
            match self.scheduled_stages().find(|(_, s)| s.name == stage.name) {
                None => diff.added.push(stage.name.clone()),
                Some((old_group, old)) => {
                    if old.artifact_ref != stage.artifact_ref
                        || old.properties != stage.properties
                        || old.mode != stage.mode
                        || old_group.max_restarts != group.max_restarts
                    {
                        diff.changed.push(stage.name.clone());
                    }
                }
            }
        }
        for (_, stage) in self.scheduled_stages() {
            if !next.scheduled_stages().any(|(_, s)| s.name == stage.name) {
                diff.removed.push(stage.name.clone());
            }
        }
        diff
    }
}
