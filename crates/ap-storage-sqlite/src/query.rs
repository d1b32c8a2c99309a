//! Query Engine (§4.7): orchestrates the Filter Compiler, Document Store,
//! and Collection Store; post-filters and hydrates the result.

use crate::collections;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::iri::{classify, CollectionKind, Iri, Table};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

/// Either a single decoded item, or a page of a collection.
#[derive(Debug, Clone)]
pub enum Loaded {
    Item(Document),
    Collection(CollectionPage),
}

/// A collection result: the explicit collection wrapper (if one exists at
/// this IRI) plus its resolved member documents.
#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    pub iri: Option<Iri>,
    pub items: Vec<Document>,
}

/// `load(iri)` (§4.7).
pub fn load(db: &Connection, iri: &Iri, query: &[(String, String)]) -> Result<Loaded> {
    let filter = Filter::from_iri_query(iri, query);
    let classification = classify(iri);
    let table = classification.table;

    let mut items = select_documents(db, table.name(), &filter)?;
    let explicit = collections::load_raw(db, iri)?;

    if items.is_empty() && explicit.is_none() {
        // §4.7 step 5: fall back to pure collection-table lookup by
        // fetching each member IRI from its own classified table.
        if let Some(kind) = classification.kind {
            if kind.is_mandatory() {
                return Err(Error::NotFound(format!("mandatory collection {iri}")));
            }
            return Ok(Loaded::Collection(CollectionPage {
                iri: Some(iri.clone()),
                items: Vec::new(),
            }));
        }
        return Err(Error::NotFound(format!("{iri}")));
    }

    let mut page = CollectionPage::default();
    if let Some((explicit_doc, member_iris)) = explicit {
        page.iri = Some(explicit_doc.iri()?);
        for member in member_iris {
            let member_class = classify(&member);
            let item_filter = Filter {
                item_key: Some(member.as_str().to_string()),
                ..Filter::new()
            };
            if let Ok(found) = select_documents(db, member_class.table.name(), &item_filter) {
                page.items.extend(found);
            }
        }
        // Documents already matched against the table (if any) become
        // additional items alongside the explicit collection's own list.
        page.items.append(&mut items);
    } else {
        page.items.append(&mut items);
    }

    hydrate(db, &mut page.items, &filter)?;
    page.items.retain(|doc| filter.matches(doc));

    // §4.7 step 8: a single-element result unwraps to that item when the
    // original IRI identified a single item rather than a collection —
    // i.e. it named no collection kind at all, or named an item within one.
    let identifies_single_item = classification.kind.is_none() || classification.item_key.is_some();
    if page.items.len() == 1 && identifies_single_item {
        return Ok(Loaded::Item(page.items.into_iter().next().unwrap()));
    }

    Ok(Loaded::Collection(page))
}

fn select_documents(db: &Connection, table: &str, filter: &Filter) -> Result<Vec<Document>> {
    let compiled = filter.compile(table);
    let sql = format!(
        "SELECT raw FROM {table} WHERE {} ORDER BY published ASC {}",
        compiled.where_body(),
        compiled.limit
    );
    let mut stmt = db.prepare(&sql)?;
    let binds: Vec<&dyn rusqlite::ToSql> = compiled.binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(params_from_iter(binds), |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let raw = row?;
        out.push(Document::new(serde_json::from_str(&raw)?));
    }
    Ok(out)
}

/// §4.7 step 6: hydrate `tag[i]` IRIs (single-level) on every item, and for
/// activities, hydrate `actor`/`object`/`target` sub-filters, dropping
/// activities whose sub-entity doesn't satisfy its sub-filter.
fn hydrate(db: &Connection, items: &mut Vec<Document>, filter: &Filter) -> Result<()> {
    for doc in items.iter_mut() {
        let tag_iris = doc.tag_iris();
        if !tag_iris.is_empty() {
            let mut hydrated_tags = Vec::new();
            for tag_iri in tag_iris {
                if let Ok(Some(found)) = load_single_by_iri(db, &tag_iri) {
                    hydrated_tags.push(found.value().clone());
                }
            }
            if !hydrated_tags.is_empty() {
                doc.inline("tag", Value::Array(hydrated_tags));
            }
        }
    }

    let mut keep = vec![true; items.len()];
    for (sub_field, sub_filter) in [
        ("actor", &filter.actor),
        ("object", &filter.object),
        ("target", &filter.target),
    ] {
        let Some(sub_filter) = sub_filter else {
            continue;
        };
        for (i, doc) in items.iter_mut().enumerate() {
            if !keep[i] {
                continue;
            }
            let Some(ref_iri) = doc.ref_iri(sub_field) else {
                keep[i] = false;
                continue;
            };
            match load_single_by_iri(db, &ref_iri) {
                Ok(Some(found)) => {
                    if sub_filter.matches(&found) {
                        doc.inline(sub_field, found.value().clone());
                    } else {
                        keep[i] = false;
                    }
                }
                _ => keep[i] = false,
            }
        }
    }
    let mut idx = 0;
    items.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    Ok(())
}

fn load_single_by_iri(db: &Connection, iri: &Iri) -> Result<Option<Document>> {
    let classification = classify(iri);
    let table = classification.table;
    let filter = Filter {
        item_key: Some(iri.as_str().to_string()),
        ..Filter::new()
    };
    let mut docs = select_documents(db, table.name(), &filter)?;
    Ok(docs.pop())
}

/// Maps a `CollectionKind` to the implicit-collection `LIKE`-prefix scan
/// used by §3 "Implicit collection" when no explicit row exists.
pub fn implicit_prefix_table(kind: CollectionKind) -> Table {
    kind.table()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::NoopCache;
    use crate::schema::create_schema;
    use crate::store;
    use serde_json::json;

    fn setup() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        db
    }

    #[test]
    fn load_single_actor() {
        let db = setup();
        let doc = Document::new(json!({"id": "https://example.com/actors/jdoe", "type": "Person"}));
        store::save(&db, &NoopCache, None, None, doc.clone()).unwrap();

        let iri = Iri::parse("https://example.com/actors/jdoe").unwrap();
        let loaded = load(&db, &iri, &[]).unwrap();
        match loaded {
            Loaded::Item(d) => assert_eq!(d.id_str(), Some("https://example.com/actors/jdoe")),
            Loaded::Collection(_) => panic!("expected single item"),
        }
    }

    #[test]
    fn load_never_written_mandatory_collection_is_not_found() {
        let db = setup();
        let actor = Document::new(json!({"id": "https://example.com/actors/jdoe", "type": "Person"}));
        store::save(&db, &NoopCache, None, None, actor).unwrap();

        let inbox = Iri::parse("https://example.com/actors/jdoe/inbox").unwrap();
        let err = load(&db, &inbox, &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn add_to_then_load_inbox_returns_collection_with_item() {
        let db = setup();
        let col = Document::new(json!({
            "id": "https://example.com/actors/jdoe/inbox",
            "type": "OrderedCollection",
        }));
        collections::create(&db, &col).unwrap();
        let note = Document::new(json!({
            "id": "https://example.com/actors/jdoe/n1",
            "type": "Note",
        }));
        collections::add_to(&db, &col.iri().unwrap(), &note).unwrap();
        store::save(&db, &NoopCache, None, None, note).unwrap();

        let inbox_iri = Iri::parse("https://example.com/actors/jdoe/inbox").unwrap();
        let loaded = load(&db, &inbox_iri, &[]).unwrap();
        match loaded {
            Loaded::Collection(page) => {
                assert_eq!(page.items.len(), 1);
                assert_eq!(
                    page.items[0].id_str(),
                    Some("https://example.com/actors/jdoe/n1")
                );
            }
            Loaded::Item(_) => panic!("expected collection"),
        }
    }
}
