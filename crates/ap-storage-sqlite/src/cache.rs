//! Optional in-process cache (§5, §9): an IRI → decoded-document map that is
//! never authoritative. Write-through on `save`, invalidate on `delete`,
//! read-through on single-item `load`.

use crate::document::Document;
use crate::iri::Iri;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Capability object held by the `Repository`, never read through a
/// process-wide singleton (§9 "Optional cache dependency").
pub trait Cache: fmt::Debug + Send + Sync {
    fn get(&self, iri: &Iri) -> Option<Document>;
    fn put(&self, iri: Iri, doc: Document);
    fn invalidate(&self, iri: &Iri);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl Cache for NoopCache {
    fn get(&self, _iri: &Iri) -> Option<Document> {
        None
    }
    fn put(&self, _iri: Iri, _doc: Document) {}
    fn invalidate(&self, _iri: &Iri) {}
}

/// Unbounded `RwLock<HashMap<..>>`-backed cache; supports concurrent reads
/// and exclusive writes. Capacity/eviction policy is intentionally
/// unspecified (§5), matching the source's lack of one.
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: RwLock<HashMap<Iri, Document>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Cache for MemoryCache {
    fn get(&self, iri: &Iri) -> Option<Document> {
        self.inner.read().expect("cache lock poisoned").get(iri).cloned()
    }

    fn put(&self, iri: Iri, doc: Document) {
        self.inner
            .write()
            .expect("cache lock poisoned")
            .insert(iri, doc);
    }

    fn invalidate(&self, iri: &Iri) {
        self.inner.write().expect("cache lock poisoned").remove(iri);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn noop_cache_never_returns_anything() {
        let cache = NoopCache;
        let iri = Iri::parse("https://e.com/a").unwrap();
        cache.put(iri.clone(), Document::new(json!({"id": "https://e.com/a"})));
        assert!(cache.get(&iri).is_none());
    }

    #[test]
    fn memory_cache_write_through_and_invalidate() {
        let cache = MemoryCache::new();
        let iri = Iri::parse("https://e.com/a").unwrap();
        let doc = Document::new(json!({"id": "https://e.com/a", "type": "Note"}));
        cache.put(iri.clone(), doc.clone());
        assert_eq!(cache.get(&iri), Some(doc));
        cache.invalidate(&iri);
        assert_eq!(cache.get(&iri), None);
    }
}
