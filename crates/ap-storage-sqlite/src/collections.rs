//! Collection Store (§4.6): explicit collection documents, stored whole,
//! with their membership flattened to an `items` IRI list.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::iri::Iri;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

/// `create(col)` (§4.6): require non-nil, require a non-empty `id`;
/// serialize; insert with an empty `items` list.
pub fn create(db: &Connection, col: &Document) -> Result<Document> {
    if col.is_null() {
        return Err(Error::NilArgument("collection".into()));
    }
    let mut col = col.clone();
    col.canonicalize_id()?;
    let published = col
        .published()
        .unwrap_or_else(Utc::now)
        .to_rfc3339();
    let raw = serde_json::to_string(col.value())?;
    let empty_items: Vec<u8> = serde_json::to_vec(&Value::Array(Vec::new()))?;
    db.execute(
        "INSERT INTO collections (published, raw, items) VALUES (?, ?, ?)",
        params![published, raw, empty_items],
    )?;
    Ok(col)
}

/// Load the raw JSON and flattened item list for an explicit collection.
pub fn load_raw(db: &Connection, col_iri: &Iri) -> Result<Option<(Document, Vec<Iri>)>> {
    let row: Option<(String, Vec<u8>)> = db
        .query_row(
            "SELECT raw, items FROM collections WHERE iri = ?",
            params![col_iri.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((raw, items)) = row else {
        return Ok(None);
    };
    let doc = Document::new(serde_json::from_str(&raw)?);
    let item_iris: Vec<String> = serde_json::from_slice(&items)?;
    let iris = item_iris
        .into_iter()
        .filter_map(|s| Iri::parse(&s).ok())
        .collect();
    Ok(Some((doc, iris)))
}

/// `add_to(col_iri, item)` (§4.6): append `item.iri` to the stored list.
/// Duplicates are tolerated (best-effort idempotent, per the policy note).
pub fn add_to(db: &Connection, col_iri: &Iri, item: &Document) -> Result<()> {
    let Some((mut col, mut items)) = load_raw(db, col_iri)? else {
        return Err(Error::NotFound(format!("collection {col_iri}")));
    };
    let item_iri = item.iri()?;
    items.push(item_iri);
    col.set_updated_now();
    write_back(db, col_iri, &col, &items)
}

/// `remove_from(col_iri, item)` (§4.6): symmetric to `add_to`; silently
/// no-ops if the item isn't present.
pub fn remove_from(db: &Connection, col_iri: &Iri, item: &Document) -> Result<()> {
    let Some((mut col, mut items)) = load_raw(db, col_iri)? else {
        return Err(Error::NotFound(format!("collection {col_iri}")));
    };
    let item_iri = item.iri()?;
    items.retain(|i| i != &item_iri);
    col.set_updated_now();
    write_back(db, col_iri, &col, &items)
}

fn write_back(db: &Connection, col_iri: &Iri, col: &Document, items: &[Iri]) -> Result<()> {
    let item_strs: Vec<&str> = items.iter().map(Iri::as_str).collect();
    let items_json: Value = json!(item_strs);
    let raw = serde_json::to_string(col.value())?;
    let items_blob = serde_json::to_vec(&items_json)?;
    db.execute(
        "UPDATE collections SET raw = ?, items = ? WHERE iri = ?",
        params![raw, items_blob, col_iri.as_str()],
    )?;
    Ok(())
}
