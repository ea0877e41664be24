use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Downstream intent of a document, set by whoever inserted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[default]
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Add => "ADD",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Processed,
    Discarded,
    Failed,
}

/// Stamp written when a document leaves the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub stage: String,
    pub at: DateTime<Utc>,
}

/// Identifies one claim of a stage on a document: the `fetched` stamp that claim wrote.
///
/// Every call that ends or extends a claim must present the token it was handed,
/// so a holder whose lease was reissued cannot act on someone else's claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub DateTime<Utc>);

/// Set by a stage that handed the document to something outside the pipeline and
/// is waiting for it to finish. No stage can claim a pending document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMark {
    pub stage: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// stage -> time the stage finished with the document
    #[serde(default)]
    pub touched: BTreeMap<String, DateTime<Utc>>,
    /// stage -> time the stage claimed the document
    #[serde(default)]
    pub fetched: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingMark>,
    /// Free-form keys written by stages.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The unit of work moving through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Empty until the store assigns one.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub contents: Map<String, Value>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(contents: Map<String, Value>) -> Self {
        Document {
            contents,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Builds a document from a JSON object literal; non-objects give empty contents.
    pub fn from_value(contents: Value) -> Self {
        match contents {
            Value::Object(map) => Document::new(map),
            _ => Document::default(),
        }
    }

    pub fn content_field(&self, path: &[String]) -> Option<&Value> {
        lookup_path(&self.contents, path)
    }

    /// Resolves a metadata path, including the `touched`/`fetched`/`outcome` maps.
    pub fn metadata_field(&self, path: &[String]) -> Option<Value> {
        let (head, rest) = path.split_first()?;
        match head.as_str() {
            "touched" | "fetched" | "outcome" | "pending" => {
                let value = serde_json::to_value(&self.metadata).ok()?;
                let root = value.as_object()?;
                lookup_path(root, path).cloned()
            }
            _ => {
                let first = self.metadata.extra.get(head)?;
                walk(first, rest).cloned()
            }
        }
    }

    pub fn is_touched_by(&self, stage: &str) -> bool {
        self.metadata.touched.contains_key(stage)
    }

    pub fn is_fetched_by(&self, stage: &str) -> bool {
        self.metadata.fetched.contains_key(stage)
    }

    /// The token of `stage`'s claim as recorded on this copy of the document.
    pub fn claim_token(&self, stage: &str) -> Option<ClaimToken> {
        self.metadata.fetched.get(stage).copied().map(ClaimToken)
    }

    /// `stage` claimed the document and has not touched it since.
    pub fn has_open_claim(&self, stage: &str) -> bool {
        match self.metadata.fetched.get(stage) {
            Some(fetched) => !self
                .metadata
                .touched
                .get(stage)
                .is_some_and(|touched| touched >= fetched),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.metadata.pending.is_some()
    }

    /// Serialized size in bytes, used for the archive byte bound.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Result of running a stage's steps over one claimed document.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Success(Document),
    Filtered { document: Document, reason: String },
    Error { id: String, error_message: String },
}

pub(crate) fn lookup_path<'a>(root: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (head, rest) = path.split_first()?;
    walk(root.get(head)?, rest)
}

fn walk<'a>(mut current: &'a Value, path: &[String]) -> Option<&'a Value> {
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_nested_content_lookup() {
        let doc = Document::from_value(json!({"a": {"b": {"c": 3}}, "x": 1}));
        assert_eq!(doc.content_field(&path("a.b.c")), Some(&json!(3)));
        assert_eq!(doc.content_field(&path("x")), Some(&json!(1)));
        assert_eq!(doc.content_field(&path("a.z")), None);
        assert_eq!(doc.content_field(&path("x.y")), None);
    }

    #[test]
    fn test_wire_format() {
        let raw = json!({
            "id": "d1",
            "action": "DELETE",
            "contents": {"title": "t"},
            "metadata": {"touched": {"A": "2024-01-01T00:00:00Z"}, "fetched": {}, "source": "rss"}
        });
        let doc: Document = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.action, Action::Delete);
        assert!(doc.is_touched_by("A"));
        assert_eq!(doc.metadata.extra.get("source"), Some(&json!("rss")));
        assert_eq!(doc.metadata_field(&path("source")), Some(json!("rss")));
        assert!(doc.metadata_field(&path("touched.A")).is_some());
        assert!(doc.metadata_field(&path("fetched.A")).is_none());

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["metadata"]["source"], json!("rss"));
        assert!(back["metadata"].get("outcome").is_none());
    }

    #[test]
    fn test_claim_token_and_open_claim() {
        let mut doc = Document::default().with_id("d");
        assert!(doc.claim_token("S").is_none());
        assert!(!doc.has_open_claim("S"));

        let fetched = Utc::now();
        doc.metadata.fetched.insert("S".to_string(), fetched);
        assert_eq!(doc.claim_token("S"), Some(ClaimToken(fetched)));
        assert!(doc.has_open_claim("S"));

        doc.metadata
            .touched
            .insert("S".to_string(), fetched + chrono::Duration::milliseconds(1));
        assert!(!doc.has_open_claim("S"));

        // The token survives the wire unchanged.
        let back: Document = serde_json::from_value(serde_json::to_value(&doc).unwrap()).unwrap();
        assert_eq!(back.claim_token("S"), Some(ClaimToken(fetched)));
    }

    #[test]
    fn test_missing_fields_default() {
        let doc: Document = serde_json::from_value(json!({"contents": {"a": 1}})).unwrap();
        assert!(doc.id.is_empty());
        assert_eq!(doc.action, Action::Add);
        assert!(doc.metadata.touched.is_empty());
    }
}
