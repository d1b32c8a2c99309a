//! Filter Compiler (§4.4): translates a structured `Filter` record into SQL
//! WHERE fragments and bind values, and separately re-applies itself as an
//! in-memory post-filter (§4.7 step 7) against decoded documents.

use crate::document::Document;
use crate::iri::{classify, CollectionKind, Iri};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Sentinel matching the ActivityStreams "no language" tag convention; an
/// empty string or this sentinel both mean "absent" for `StrOp` purposes.
const NIL_LANG_REF: &str = "-";

/// §4.4 operator language: `=`, `!`, `~`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Eq,
    Neq,
    Like,
}

impl StrOp {
    pub fn parse(raw: &str) -> (StrOp, &str) {
        match raw.as_bytes().first() {
            Some(b'!') => (StrOp::Neq, &raw[1..]),
            Some(b'~') => (StrOp::Like, &raw[1..]),
            Some(b'=') => (StrOp::Eq, &raw[1..]),
            _ => (StrOp::Eq, raw),
        }
    }

    fn is_absent(value: &str) -> bool {
        value.is_empty() || value == NIL_LANG_REF
    }

    /// Compile one `column OP value` predicate, pushing any bind value.
    fn compile_native(&self, column: &str, value: &str, binds: &mut Vec<SqlValue>) -> String {
        match (self, Self::is_absent(value)) {
            (StrOp::Eq, true) => format!("{column} IS NULL"),
            (StrOp::Neq, true) => format!("{column} IS NOT NULL"),
            (StrOp::Eq, false) => {
                binds.push(SqlValue::from(value.to_string()));
                format!("{column} = ?")
            }
            (StrOp::Neq, false) => {
                binds.push(SqlValue::from(value.to_string()));
                format!("{column} != ?")
            }
            (StrOp::Like, _) => {
                binds.push(SqlValue::from(format!("%{value}%")));
                format!("{column} LIKE ?")
            }
        }
    }
}

/// A single field's accumulated string values, joined with `OR`.
#[derive(Debug, Clone, Default)]
pub struct StrField(pub Vec<String>);

impl StrField {
    pub fn push(&mut self, raw: impl Into<String>) {
        self.0.push(raw.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pagination mode: page-offset or cursor-based (§4.4).
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub cur_page: i64,
    pub next: Option<String>,
    pub prev: Option<String>,
}

/// The structured filter record (§4.4 Input).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub types: StrField,
    pub iris: StrField,
    pub names: StrField,
    pub urls: StrField,
    pub context: StrField,
    pub in_reply_to: StrField,
    pub attributed_to: StrField,
    /// Explicit IRI set naming exactly one item within a collection.
    pub item_key: Option<String>,
    pub actor: Option<Box<Filter>>,
    pub object: Option<Box<Filter>>,
    pub target: Option<Box<Filter>>,
    pub max_items: i64,
    pub pagination: Pagination,
    pub collection: Option<CollectionKind>,
}

impl Filter {
    pub fn new() -> Self {
        Filter {
            max_items: 100,
            ..Default::default()
        }
    }

    /// §4.4 "Parsing from a query string": consumes an IRI's query
    /// parameters the way `Query Engine::load` needs. Sub-filter parameters
    /// are namespaced `actor.*`/`object.*`/`target.*`; one level of nesting
    /// only (§9 "Filter recursion" depth cap — nested sub-filter params on
    /// a sub-filter are parsed but ignored by the Query Engine, not here).
    pub fn from_iri_query(iri: &Iri, query: &[(String, String)]) -> Filter {
        let mut f = Filter::new();
        let classification = classify(iri);
        f.collection = classification.kind;
        // The IRI names a single document unless its own terminal segment
        // is a bare collection name (e.g. `.../inbox`), in which case it
        // names the collection itself and step 5's implicit-scan fallback
        // takes over instead.
        if classification.kind.is_none() || classification.item_key.is_some() {
            f.item_key = Some(iri.as_str().to_string());
        }

        let mut actor = Filter::new();
        let mut object = Filter::new();
        let mut target = Filter::new();
        let mut has_actor = false;
        let mut has_object = false;
        let mut has_target = false;

        for (k, v) in query {
            if let Some(rest) = k.strip_prefix("actor.") {
                has_actor = true;
                apply_query_field(&mut actor, rest, v);
            } else if let Some(rest) = k.strip_prefix("object.") {
                has_object = true;
                apply_query_field(&mut object, rest, v);
            } else if let Some(rest) = k.strip_prefix("target.") {
                has_target = true;
                apply_query_field(&mut target, rest, v);
            } else {
                apply_query_field(&mut f, k, v);
            }
        }

        if has_actor {
            f.actor = Some(Box::new(actor));
        }
        if has_object {
            f.object = Some(Box::new(object));
        }
        if has_target {
            f.target = Some(Box::new(target));
        }
        f
    }

    /// Compile to WHERE fragments + bind values + LIMIT clause (§4.4
    /// Output). `table` distinguishes the `iris` routing rule (collection
    /// prefix vs. exact match) and is used to build the `next`/`prev`
    /// cursor subqueries.
    pub fn compile(&self, table: &str) -> CompiledFilter {
        let mut predicates = Vec::new();
        let mut binds = Vec::new();

        if let Some(key) = &self.item_key {
            predicates.push(StrOp::Eq.compile_native("iri", key, &mut binds));
        } else {
            push_or_group(&self.types, "type", &mut predicates, &mut binds);
            push_iri_group(&self.iris, &mut predicates, &mut binds);
            push_json_or_native_group(&self.urls, &["url", "$.url"], &mut predicates, &mut binds);
            push_json_group(&self.names, &["$.name", "$.preferredUsername"], &mut predicates, &mut binds);
            push_json_group(&self.context, &["$.context"], &mut predicates, &mut binds);
            push_json_group(&self.in_reply_to, &["$.inReplyTo"], &mut predicates, &mut binds);
            push_json_group(&self.attributed_to, &["$.attributedTo"], &mut predicates, &mut binds);
        }

        if predicates.is_empty() {
            // An empty filter over a recognized collection namespace
            // enumerates that namespace (`true`); otherwise refuse to
            // enumerate a whole table (`false`).
            predicates.push(if self.collection.is_some() { "1=1" } else { "0=1" }.to_string());
        }

        let mut limit = format!("LIMIT {}", self.max_items.max(0));
        if self.pagination.cur_page > 0 {
            limit.push_str(&format!(
                " OFFSET {}",
                self.max_items.max(0) * (self.pagination.cur_page - 1)
            ));
        } else if let Some(next) = &self.pagination.next {
            predicates.push(format!(
                "published < (SELECT published FROM {table} WHERE iri = ?)"
            ));
            binds.push(SqlValue::from(next.clone()));
        } else if let Some(prev) = &self.pagination.prev {
            predicates.push(format!(
                "published > (SELECT published FROM {table} WHERE iri = ?)"
            ));
            binds.push(SqlValue::from(prev.clone()));
        }

        CompiledFilter {
            predicates,
            binds,
            limit,
        }
    }

    /// §4.7 step 7: re-apply this filter in memory against a decoded
    /// document, to catch predicates the SQL layer only approximated
    /// (JSON-extracted OR-groups, sub-filter hydration checks).
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(key) = &self.item_key {
            return doc.id_str() == Some(key.as_str());
        }
        str_field_matches(&self.types, doc.ap_type())
            && iris_field_matches(&self.iris, doc)
            && url_field_matches(&self.urls, doc)
            && name_field_matches(&self.names, doc)
            && json_field_matches(&self.context, doc, "context")
            && json_field_matches(&self.in_reply_to, doc, "inReplyTo")
            && json_field_matches(&self.attributed_to, doc, "attributedTo")
    }
}

/// Result of compiling a `Filter` (§4.4 Output).
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub predicates: Vec<String>,
    pub binds: Vec<SqlValue>,
    pub limit: String,
}

impl CompiledFilter {
    /// Joins the predicate fragments with `AND` into a ready-to-use WHERE
    /// clause body (without the `WHERE` keyword, so callers can compose it
    /// into `SELECT ... WHERE <body> <limit>`).
    pub fn where_body(&self) -> String {
        self.predicates.join(" AND ")
    }
}

fn apply_query_field(f: &mut Filter, key: &str, value: &str) {
    match key {
        "type" => f.types.push(value),
        "iri" => f.iris.push(value),
        "name" => f.names.push(value),
        "url" => f.urls.push(value),
        "context" => f.context.push(value),
        "inReplyTo" => f.in_reply_to.push(value),
        "attributedTo" => f.attributed_to.push(value),
        "maxItems" => {
            if let Ok(n) = value.parse() {
                f.max_items = n;
            }
        }
        "page" => {
            if let Ok(n) = value.parse() {
                f.pagination.cur_page = n;
            }
        }
        "next" => f.pagination.next = Some(value.to_string()),
        "prev" => f.pagination.prev = Some(value.to_string()),
        _ => {}
    }
}

fn push_or_group(field: &StrField, column: &str, predicates: &mut Vec<String>, binds: &mut Vec<SqlValue>) {
    if field.is_empty() {
        return;
    }
    let parts: Vec<String> = field
        .0
        .iter()
        .map(|raw| {
            let (op, value) = StrOp::parse(raw);
            op.compile_native(column, value, binds)
        })
        .collect();
    predicates.push(format!("({})", parts.join(" OR ")));
}

fn push_json_group(field: &StrField, json_paths: &[&str], predicates: &mut Vec<String>, binds: &mut Vec<SqlValue>) {
    if field.is_empty() {
        return;
    }
    let mut parts = Vec::new();
    for raw in &field.0 {
        let (op, value) = StrOp::parse(raw);
        for path in json_paths {
            let column = format!("json_extract(raw, '{path}')");
            parts.push(op.compile_native(&column, value, binds));
        }
    }
    predicates.push(format!("({})", parts.join(" OR ")));
}

fn push_json_or_native_group(
    field: &StrField,
    columns: &[&str],
    predicates: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) {
    if field.is_empty() {
        return;
    }
    let mut parts = Vec::new();
    for raw in &field.0 {
        let (op, value) = StrOp::parse(raw);
        for col in columns {
            let column = if col.starts_with('$') {
                format!("json_extract(raw, '{col}')")
            } else {
                (*col).to_string()
            };
            parts.push(op.compile_native(&column, value, binds));
        }
    }
    predicates.push(format!("({})", parts.join(" OR ")));
}

/// `iris` field: routing per §4.4 — collection-prefix `LIKE` for an IRI
/// whose last segment is a collection kind, exact match otherwise.
fn push_iri_group(field: &StrField, predicates: &mut Vec<String>, binds: &mut Vec<SqlValue>) {
    if field.is_empty() {
        return;
    }
    let mut parts = Vec::new();
    for raw in &field.0 {
        let (op, value) = StrOp::parse(raw);
        let is_collection_prefix = Iri::parse(value)
            .ok()
            .and_then(|iri| iri.last_segment().and_then(CollectionKind::from_segment))
            .is_some();
        if is_collection_prefix && op == StrOp::Eq {
            binds.push(SqlValue::from(format!("{value}%")));
            parts.push("iri LIKE ?".to_string());
        } else {
            parts.push(op.compile_native("iri", value, binds));
        }
    }
    predicates.push(format!("({})", parts.join(" OR ")));
}

fn str_field_matches(field: &StrField, value: Option<&str>) -> bool {
    if field.is_empty() {
        return true;
    }
    field.0.iter().any(|raw| {
        let (op, expect) = StrOp::parse(raw);
        match op {
            StrOp::Eq if StrOp::is_absent(expect) => value.is_none(),
            StrOp::Neq if StrOp::is_absent(expect) => value.is_some(),
            StrOp::Eq => value == Some(expect),
            StrOp::Neq => value != Some(expect),
            StrOp::Like => value.map(|v| v.contains(expect)).unwrap_or(false),
        }
    })
}

fn iris_field_matches(field: &StrField, doc: &Document) -> bool {
    str_field_matches(field, doc.id_str())
}

fn url_field_matches(field: &StrField, doc: &Document) -> bool {
    let url = doc.get("url").and_then(Value::as_str);
    str_field_matches(field, url)
}

fn name_field_matches(field: &StrField, doc: &Document) -> bool {
    if field.is_empty() {
        return true;
    }
    let name = doc.get("name").and_then(Value::as_str);
    let preferred = doc.get("preferredUsername").and_then(Value::as_str);
    field.0.iter().any(|raw| {
        let (op, expect) = StrOp::parse(raw);
        [name, preferred].into_iter().any(|v| match op {
            StrOp::Eq if StrOp::is_absent(expect) => v.is_none(),
            StrOp::Neq if StrOp::is_absent(expect) => v.is_some(),
            StrOp::Eq => v == Some(expect),
            StrOp::Neq => v != Some(expect),
            StrOp::Like => v.map(|s| s.contains(expect)).unwrap_or(false),
        })
    })
}

fn json_field_matches(field: &StrField, doc: &Document, key: &str) -> bool {
    if field.is_empty() {
        return true;
    }
    let value = doc.get(key).and_then(Value::as_str);
    str_field_matches(field, value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_operator_prefix() {
        assert_eq!(StrOp::parse("=Note"), (StrOp::Eq, "Note"));
        assert_eq!(StrOp::parse("!Note"), (StrOp::Neq, "Note"));
        assert_eq!(StrOp::parse("~ote"), (StrOp::Like, "ote"));
        assert_eq!(StrOp::parse("Note"), (StrOp::Eq, "Note"));
    }

    #[test]
    fn empty_filter_over_collection_is_true() {
        let mut f = Filter::new();
        f.collection = Some(CollectionKind::Inbox);
        let compiled = f.compile("activities");
        assert_eq!(compiled.where_body(), "1=1");
    }

    #[test]
    fn empty_filter_over_unknown_is_false() {
        let f = Filter::new();
        let compiled = f.compile("objects");
        assert_eq!(compiled.where_body(), "0=1");
    }

    #[test]
    fn type_filter_compiles_native_column() {
        let mut f = Filter::new();
        f.types.push("Note");
        let compiled = f.compile("objects");
        assert_eq!(compiled.where_body(), "(type = ?)");
        assert_eq!(compiled.binds.len(), 1);
    }

    #[test]
    fn names_filter_checks_both_json_paths() {
        let mut f = Filter::new();
        f.names.push("jdoe");
        let compiled = f.compile("actors");
        assert!(compiled.where_body().contains("$.name"));
        assert!(compiled.where_body().contains("$.preferredUsername"));
    }

    #[test]
    fn pagination_page_offset() {
        let mut f = Filter::new();
        f.max_items = 10;
        f.pagination.cur_page = 2;
        let compiled = f.compile("objects");
        assert_eq!(compiled.limit, "LIMIT 10 OFFSET 10");
    }

    #[test]
    fn in_memory_match_mirrors_eq_semantics() {
        let mut f = Filter::new();
        f.types.push("Note");
        let doc = Document::new(json!({"id": "https://e.com/1", "type": "Note"}));
        assert!(f.matches(&doc));

        let other = Document::new(json!({"id": "https://e.com/2", "type": "Article"}));
        assert!(!f.matches(&other));
    }
}
