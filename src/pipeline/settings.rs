use crate::config::pipeline::StepConfig;
use crate::error::{PipelineError, Result};
use crate::query::Query;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_HOLD_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Suggested `recurringInterval`; recurring claims are off unless the key is set.
pub const DEFAULT_RECURRING_INTERVAL_MS: u64 = 2000;
const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Raw view of the well-known keys in a stage's property map. Unknown keys are ignored.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    query: Option<Query>,
    query_options: Option<Vec<String>>,
    hold_interval: Option<u64>,
    heartbeat_interval: Option<u64>,
    recurring_interval: Option<u64>,
    #[serde(default)]
    steps: Vec<StepConfig>,
    #[serde(default)]
    output: bool,
}

/// Typed, validated configuration of a stage worker.
#[derive(Debug, Clone)]
pub struct StageSettings {
    /// What the stage subscribes to. `query` and `queryOptions` are conjoined.
    pub subscription: Query,
    pub hold_interval: Duration,
    pub heartbeat_interval: Duration,
    /// When set, the stage also re-claims documents it last claimed at least this long ago.
    pub recurring_interval: Option<Duration>,
    pub steps: Vec<StepConfig>,
    pub output: bool,
}

impl StageSettings {
    pub fn from_properties(properties: &Map<String, Value>) -> Result<Self> {
        let raw: RawSettings = serde_json::from_value(Value::Object(properties.clone()))
            .map_err(|e| {
                PipelineError::ConfigValidationError(format!("Invalid stage properties: {}", e))
            })?;

        let mut subscription = raw.query.unwrap_or_default();
        if let Some(options) = &raw.query_options {
            subscription = subscription.and(Query::parse_all(options)?);
        }
        // Surface bad field paths now rather than at the first claim.
        subscription.compile()?;

        let hold = raw.hold_interval.unwrap_or(DEFAULT_HOLD_INTERVAL_MS);
        let heartbeat = raw
            .heartbeat_interval
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        let recurring = raw.recurring_interval;
        let intervals = [
            ("holdInterval", Some(hold)),
            ("heartbeatInterval", Some(heartbeat)),
            ("recurringInterval", recurring),
        ];
        for (name, value) in intervals
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
        {
            if value == 0 || value > MAX_INTERVAL_MS {
                return Err(PipelineError::ConfigValidationError(format!(
                    "StageSettings: {} must be between 1 and {} ms, got {}",
                    name, MAX_INTERVAL_MS, value
                )));
            }
        }

        for step in &raw.steps {
            step.validate()?;
        }

        Ok(StageSettings {
            subscription,
            hold_interval: Duration::from_millis(hold),
            heartbeat_interval: Duration::from_millis(heartbeat),
            recurring_interval: recurring.map(Duration::from_millis),
            steps: raw.steps,
            output: raw.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = StageSettings::from_properties(&Map::new()).unwrap();
        assert!(s.subscription.is_empty());
        assert_eq!(s.hold_interval, Duration::from_millis(DEFAULT_HOLD_INTERVAL_MS));
        assert!(s.steps.is_empty());
        assert!(s.recurring_interval.is_none());
        assert!(!s.output);
    }

    #[test]
    fn test_recurring_interval() {
        let s = StageSettings::from_properties(&props(json!({
            "recurringInterval": DEFAULT_RECURRING_INTERVAL_MS
        })))
        .unwrap();
        assert_eq!(
            s.recurring_interval,
            Some(Duration::from_millis(DEFAULT_RECURRING_INTERVAL_MS))
        );
        assert!(StageSettings::from_properties(&props(json!({"recurringInterval": 0}))).is_err());
    }

    #[test]
    fn test_query_and_options_are_conjoined() {
        let s = StageSettings::from_properties(&props(json!({
            "query": {"predicates": [{"predicate": "contentFieldEquals", "field": "lang", "value": "en"}]},
            "queryOptions": ["touched(A,true)", "contents(body,true);"],
            "holdInterval": 250,
            "somethingElse": {"ignored": true}
        })))
        .unwrap();
        let expected = Query::new()
            .content_equals("lang", "en")
            .touched("A")
            .content_exists("body");
        assert!(s.subscription.same_predicates(&expected));
        assert_eq!(s.hold_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_interval_keys_are_camel_case() {
        let s = StageSettings::from_properties(&props(json!({
            "holdInterval": 40,
            "heartbeatInterval": 900
        })))
        .unwrap();
        assert_eq!(s.hold_interval, Duration::from_millis(40));
        assert_eq!(s.heartbeat_interval, Duration::from_millis(900));

        let s = StageSettings::from_properties(&props(json!({
            "hold_interval_ms": 40,
            "heartbeat_interval_ms": 900
        })))
        .unwrap();
        assert_eq!(s.hold_interval, Duration::from_millis(DEFAULT_HOLD_INTERVAL_MS));
        assert_eq!(
            s.heartbeat_interval,
            Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(StageSettings::from_properties(&props(json!({"holdInterval": 0}))).is_err());
        assert!(StageSettings::from_properties(&props(json!({"holdInterval": "fast"}))).is_err());
        assert!(matches!(
            StageSettings::from_properties(&props(json!({"queryOptions": ["touched(A,maybe)"]}))),
            Err(PipelineError::MalformedQuery(_))
        ));
        assert!(StageSettings::from_properties(&props(json!({
            "steps": [{"type": "RemoveFields", "fields": []}]
        })))
        .is_err());
    }
}
