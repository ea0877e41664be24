use crate::data_model::Document;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

#[derive(Debug, Clone)]
struct ArchivedDocument {
    doc: Document,
    bytes: usize,
}

/// Bounded, append-only history of documents that left the active set.
///
/// Two independent bounds apply: a maximum document count and a maximum total
/// serialized size. Whichever is exceeded, the oldest entries are evicted until
/// both hold again.
#[derive(Debug)]
pub struct Archive {
    entries: VecDeque<ArchivedDocument>,
    ids: HashSet<String>,
    total_bytes: usize,
    max_count: usize,
    max_bytes: usize,
}

impl Archive {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Archive {
            entries: VecDeque::new(),
            ids: HashSet::new(),
            total_bytes: 0,
            max_count,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        if !self.ids.contains(id) {
            return None;
        }
        self.entries.iter().find(|e| e.doc.id == id).map(|e| &e.doc)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.entries.iter().map(|e| &e.doc)
    }

    /// Appends without enforcing bounds; call [`Archive::enforce_bounds`] afterwards.
    /// A document that alone exceeds the byte bound is dropped and counted as evicted.
    pub fn push(&mut self, doc: Document) -> usize {
        let bytes = doc.byte_size();
        if bytes > self.max_bytes {
            warn!(
                doc_id = %doc.id,
                bytes,
                max_bytes = self.max_bytes,
                "Document larger than the archive byte bound, dropping it"
            );
            return 1;
        }
        self.total_bytes += bytes;
        self.ids.insert(doc.id.clone());
        self.entries.push_back(ArchivedDocument { doc, bytes });
        0
    }

    pub fn is_within_bounds(&self) -> bool {
        self.entries.len() <= self.max_count && self.total_bytes <= self.max_bytes
    }

    /// Evicts oldest-first until both bounds hold. Returns the number evicted.
    pub fn enforce_bounds(&mut self) -> usize {
        let mut evicted = 0;
        while !self.is_within_bounds() {
            match self.entries.pop_front() {
                Some(oldest) => {
                    self.total_bytes -= oldest.bytes;
                    self.ids.remove(&oldest.doc.id);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, body: &str) -> Document {
        Document::from_value(json!({ "body": body })).with_id(id)
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let mut archive = Archive::new(2, usize::MAX);
        for id in ["a", "b", "c"] {
            archive.push(doc(id, "x"));
        }
        assert!(!archive.is_within_bounds());
        assert_eq!(archive.enforce_bounds(), 1);
        assert!(archive.get("a").is_none());
        assert!(archive.get("c").is_some());
    }

    #[test]
    fn test_byte_bound() {
        let one = doc("a", "0123456789").byte_size();
        let mut archive = Archive::new(100, one * 2 + one / 2);
        for id in ["a", "b", "c"] {
            archive.push(doc(id, "0123456789"));
        }
        archive.enforce_bounds();
        assert_eq!(archive.len(), 2);
        assert!(archive.total_bytes() <= one * 2 + one / 2);
        assert!(!archive.contains("a"));
    }

    #[test]
    fn test_oversized_document_dropped() {
        let mut archive = Archive::new(10, 8);
        assert_eq!(archive.push(doc("big", "way too large")), 1);
        assert!(archive.is_empty());
        assert_eq!(archive.total_bytes(), 0);
    }
}
