//! The `Document` type: a typed, serde-friendly wrapper over a JSON-LD
//! value, with the accessors the rest of the engine needs and the
//! flattening/hydration helpers the Document Store and Query Engine share.

use crate::error::{Error, Result};
use crate::iri::{Iri, Table};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Embedded-collection fields that invariant I4 requires to be flattened to
/// a bare IRI string before persistence.
const FLATTEN_FIELDS: &[&str] = &[
    "inbox", "outbox", "followers", "following", "liked", "replies", "likes", "shares",
];

/// A JSON-LD ActivityPub document.
///
/// The vocabulary parser/serializer is an external collaborator (§1); this
/// type does not attempt to model the full ActivityStreams type lattice,
/// it just gives typed access to the handful of fields the storage engine
/// itself needs to route, index and flatten.
#[derive(Debug, Clone, PartialEq)]
pub struct Document(Value);

impl Document {
    pub fn new(value: Value) -> Self {
        Document(value)
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn id_str(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// The document's `id` as a canonical `Iri`. Required for every
    /// persisted document (I1).
    pub fn iri(&self) -> Result<Iri> {
        let id = self
            .id_str()
            .ok_or_else(|| Error::NilArgument("document.id".into()))?;
        Iri::parse(id).map_err(Error::from)
    }

    pub fn ap_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("published")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("updated")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_updated_now(&mut self) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(
                "updated".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
    }

    /// Routes this document to its physical table, per the routing
    /// invariant in §3: actors/activities by type, `Tombstone` by IRI
    /// inspection, everything else to `objects`.
    pub fn table(&self) -> Result<Table> {
        match self.ap_type() {
            Some("Tombstone") => Ok(Table::of_tombstone_iri(&self.iri()?)),
            Some(t) => Ok(Table::of_type(t)),
            None => Ok(Table::Objects),
        }
    }

    /// Invariant I4: replace any inlined `inbox`/`outbox`/.../`shares`
    /// Collection object with its bare `id` IRI string. No-op for fields
    /// that are absent or already a string.
    pub fn flatten(&mut self) {
        let Value::Object(map) = &mut self.0 else {
            return;
        };
        for field in FLATTEN_FIELDS {
            let Some(existing) = map.get(*field) else {
                continue;
            };
            if let Value::Object(inner) = existing {
                if let Some(id) = inner.get("id").and_then(Value::as_str) {
                    let id = id.to_string();
                    map.insert((*field).to_string(), Value::String(id));
                }
            }
        }
    }

    /// `tag[i]` IRIs, for single-level hydration by the Query Engine.
    pub fn tag_iris(&self) -> Vec<Iri> {
        let Some(tags) = self.0.get("tag").and_then(Value::as_array) else {
            return Vec::new();
        };
        tags.iter()
            .filter_map(|t| match t {
                Value::String(s) => Iri::parse(s).ok(),
                Value::Object(o) => o.get("id").and_then(Value::as_str).and_then(|s| Iri::parse(s).ok()),
                _ => None,
            })
            .collect()
    }

    /// The `actor`/`object`/`target` IRIs of an activity, as needed for
    /// sub-filter hydration. Each may be a bare IRI string or (for
    /// `object`) an inlined value.
    pub fn ref_iri(&self, field: &str) -> Option<Iri> {
        match self.0.get(field)? {
            Value::String(s) => Iri::parse(s).ok(),
            Value::Object(o) => o.get("id").and_then(Value::as_str).and_then(|s| Iri::parse(s).ok()),
            _ => None,
        }
    }

    /// Inline a hydrated sub-document into an activity's `actor`/`object`/
    /// `target` field, replacing the bare IRI.
    pub fn inline(&mut self, field: &str, value: Value) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(field.to_string(), value);
        }
    }

    /// Rewrite `id` to its canonical form (I1), so the `iri` generated
    /// column the Query Engine matches against agrees with `Iri::as_str`
    /// regardless of how the caller spelled the identifier.
    pub fn canonicalize_id(&mut self) -> Result<()> {
        let canonical = self.iri()?;
        if let Value::Object(map) = &mut self.0 {
            map.insert("id".to_string(), Value::String(canonical.to_string()));
        }
        Ok(())
    }
}

impl From<Value> for Document {
    fn from(v: Value) -> Self {
        Document(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_embedded_inbox() {
        let mut doc = Document::new(json!({
            "id": "https://example.com/actors/jdoe",
            "type": "Person",
            "inbox": {"id": "https://example.com/actors/jdoe/inbox", "type": "OrderedCollection"},
        }));
        doc.flatten();
        assert_eq!(
            doc.get("inbox").and_then(Value::as_str),
            Some("https://example.com/actors/jdoe/inbox")
        );
    }

    #[test]
    fn leaves_already_flat_fields_alone() {
        let mut doc = Document::new(json!({
            "id": "https://example.com/actors/jdoe",
            "type": "Person",
            "inbox": "https://example.com/actors/jdoe/inbox",
        }));
        doc.flatten();
        assert_eq!(
            doc.get("inbox").and_then(Value::as_str),
            Some("https://example.com/actors/jdoe/inbox")
        );
    }

    #[test]
    fn routes_by_type() {
        let actor = Document::new(json!({"id": "https://e.com/a", "type": "Person"}));
        assert_eq!(actor.table().unwrap().name(), "actors");

        let activity = Document::new(json!({"id": "https://e.com/b", "type": "Follow"}));
        assert_eq!(activity.table().unwrap().name(), "activities");

        let object = Document::new(json!({"id": "https://e.com/c", "type": "Note"}));
        assert_eq!(object.table().unwrap().name(), "objects");
    }

    #[test]
    fn routes_tombstone_by_iri() {
        let tomb = Document::new(json!({
            "id": "https://e.com/actors/jdoe",
            "type": "Tombstone",
            "formerType": "Person",
        }));
        assert_eq!(tomb.table().unwrap().name(), "actors");
    }
}
