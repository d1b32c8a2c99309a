//! Document Store (§4.5): upsert/delete of actors/activities/objects, with
//! invariant-I4 flattening and the collection-membership side effect.

use crate::cache::Cache;
use crate::collections;
use crate::config::LogSink;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::iri::{classify, Iri};
use rusqlite::{params, Connection};

/// `save(doc)` (§4.5). Flattens embedded collections, routes to table,
/// upserts by `iri`, records collection membership if the IRI lives under a
/// recognized collection path, and publishes to the cache.
pub fn save(
    db: &Connection,
    cache: &dyn Cache,
    log_fn: Option<&LogSink>,
    err_fn: Option<&LogSink>,
    doc: Document,
) -> Result<Document> {
    if doc.is_null() {
        return Err(Error::NilArgument("document".into()));
    }
    let mut doc = doc;
    doc.flatten();
    doc.canonicalize_id()?;
    let table = doc.table()?;
    let iri = doc.iri()?;
    let raw = serde_json::to_string(doc.value())?;

    db.execute(
        &format!("INSERT OR REPLACE INTO {}(raw) VALUES (?)", table.name()),
        params![raw],
    )?;

    if let Some(parent) = parent_collection(&iri) {
        // §7: `save` + `add_to` are not atomic by default; a missing parent
        // collection is tolerated here (the collection may be implicit and
        // never explicitly created), matching the "eventual consistency,
        // not atomicity" design note (§9).
        match collections::add_to(db, &parent, &doc) {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                tracing::warn!(iri = %iri, parent = %parent, "parent collection missing on save, tolerated");
                if let Some(sink) = log_fn {
                    sink(format_args!("parent collection {parent} missing for {iri}, tolerated"));
                }
            }
            Err(e) => {
                if let Some(sink) = err_fn {
                    sink(format_args!("save of {iri} failed adding to {parent}: {e}"));
                }
                return Err(e);
            }
        }
    }

    cache.put(iri, doc.clone());
    Ok(doc)
}

/// `save` + `add_to` wrapped in a single transaction, the atomic
/// alternative permitted by §9 "Collection membership races".
pub fn save_atomic(
    db: &mut Connection,
    cache: &dyn Cache,
    log_fn: Option<&LogSink>,
    err_fn: Option<&LogSink>,
    doc: Document,
) -> Result<Document> {
    if doc.is_null() {
        return Err(Error::NilArgument("document".into()));
    }
    let mut doc = doc;
    doc.flatten();
    doc.canonicalize_id()?;
    let table = doc.table()?;
    let iri = doc.iri()?;
    let raw = serde_json::to_string(doc.value())?;

    let tx = db.transaction()?;
    tx.execute(
        &format!("INSERT OR REPLACE INTO {}(raw) VALUES (?)", table.name()),
        params![raw],
    )?;
    if let Some(parent) = parent_collection(&iri) {
        match collections::add_to(&tx, &parent, &doc) {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                tracing::warn!(iri = %iri, parent = %parent, "parent collection missing on save, tolerated");
                if let Some(sink) = log_fn {
                    sink(format_args!("parent collection {parent} missing for {iri}, tolerated"));
                }
            }
            Err(e) => {
                if let Some(sink) = err_fn {
                    sink(format_args!("save of {iri} failed adding to {parent}: {e}"));
                }
                return Err(e);
            }
        }
    }
    tx.commit()?;

    cache.put(iri, doc.clone());
    Ok(doc)
}

/// `delete(item)` (§4.5). If `item` names a collection, its members are
/// deleted first (best-effort: the first failure aborts, later children
/// remain, per §7); the document row is then removed from its table and
/// evicted from the cache.
pub fn delete(db: &Connection, cache: &dyn Cache, iri: &Iri) -> Result<()> {
    let classification = classify(iri);
    if classification.kind.is_some() {
        if let Some((_, members)) = collections::load_raw(db, iri)? {
            for member in &members {
                delete(db, cache, member)?;
            }
        }
    }

    let table = classification.table;
    db.execute(
        &format!("DELETE FROM {} WHERE iri = ?", table.name()),
        params![iri.as_str()],
    )?;
    db.execute("DELETE FROM collections WHERE iri = ?", params![iri.as_str()])?;
    cache.invalidate(iri);
    Ok(())
}

/// The implicit parent collection an IRI's path names, if any (e.g. an
/// actor's `.../inbox/<key>` names `.../inbox` as its parent).
fn parent_collection(iri: &Iri) -> Option<Iri> {
    let classification = classify(iri);
    classification.kind?;
    // `classify` identifies a collection kind both for the collection's own
    // terminal segment (`.../inbox`) and for an item living inside it
    // (`.../inbox/<key>`), distinguishing the two via `item_key`. Only the
    // latter implies a membership side effect on `save` — saving the
    // collection document itself isn't an addition to its own membership.
    classification.item_key.as_ref()?;
    let segs: Vec<&str> = iri.url().path_segments()?.filter(|s| !s.is_empty()).collect();
    if segs.len() < 2 {
        return None;
    }
    let mut url = iri.url().clone();
    {
        let mut seg_mut = url.path_segments_mut().ok()?;
        seg_mut.clear();
        for s in &segs[..segs.len() - 1] {
            seg_mut.push(s);
        }
    }
    Iri::parse(url.as_str()).ok()
}
