//! Connection Lifecycle + top-level `Repository` (§5, §6): the public
//! surface that wires the Filter Compiler, Document Store, Collection
//! Store, Query Engine, Metadata Store and OAuth2 Store together over a
//! single shared database handle.

use crate::cache::{Cache, MemoryCache, NoopCache};
use crate::codec::{Codec, JsonCodec};
use crate::collections;
use crate::config::Config;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::iri::Iri;
use crate::metadata::{self, MetadataRecord, PrivateKey, PublicKey};
use crate::oauth::{self, Access, Authorize, Client};
use crate::query::{self, Loaded};
use crate::schema;
use crate::store;
use rusqlite::Connection;
use std::fs;
use std::sync::{Arc, Mutex};

/// A single repository value owning the shared database handle (§5
/// "Scheduling"). Multiple parallel operations serialize on the handle via
/// `Mutex<Connection>`, matching `rusqlite`'s own non-`Sync` connection
/// type. `Repository` is cheaply `Clone`: the `Arc`s are shared, not the
/// connection itself.
#[derive(Clone)]
pub struct Repository {
    config: Config,
    db: Arc<Mutex<Option<Connection>>>,
    cache: Arc<dyn Cache>,
    codec: Arc<dyn Codec>,
}

impl Repository {
    /// Opens (creating if needed) the repository's database handle. Mirrors
    /// `Bootstrap` in that it runs `CREATE TABLE IF NOT EXISTS`, so a fresh
    /// and an existing repository both open the same way.
    pub fn new(config: Config) -> Result<Self> {
        ensure_dir(&config.path)?;
        let db = open_connection(&config)?;
        let cache: Arc<dyn Cache> = if config.cache_enable {
            Arc::new(MemoryCache::new())
        } else {
            Arc::new(NoopCache)
        };
        Ok(Repository {
            config,
            db: Arc::new(Mutex::new(Some(db))),
            cache,
            codec: Arc::new(JsonCodec),
        })
    }

    /// Replace the codec (§4.3, §9 "Explicit codec handle") — e.g. to
    /// inject a failing codec in tests.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// `Bootstrap(config)` (§6): create the file and schema, idempotently.
    pub fn bootstrap(config: Config) -> Result<Self> {
        Self::new(config)
    }

    /// `Clean(config)` (§6): delete the database file and its WAL/SHM
    /// sidecars.
    pub fn clean(config: &Config) -> Result<()> {
        let base = config.sqlite_path();
        for suffix in ["", "-wal", "-shm"] {
            let p = format!("{}{}", base.display(), suffix);
            let _ = fs::remove_file(p);
        }
        Ok(())
    }

    /// `Reset()` (§6): `DELETE FROM` every table, keeping the schema.
    pub fn reset(&self) -> Result<()> {
        self.with_db(schema::reset)
    }

    /// Drop this repository's handle on the connection. Reference-counted
    /// via the surrounding `Arc`: only the last clone's close actually
    /// drops the `rusqlite::Connection` (§5 "Session lifecycle").
    pub fn close(&self) {
        let mut guard = self.db.lock().expect("db mutex poisoned");
        *guard = None;
    }

    fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.db.lock().expect("db mutex poisoned");
        match guard.as_mut() {
            Some(db) => f(db),
            None => {
                let db = open_connection(&self.config)?;
                let result = f(&db);
                *guard = Some(db);
                result
            }
        }
    }

    fn with_db_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.db.lock().expect("db mutex poisoned");
        match guard.as_mut() {
            Some(db) => f(db),
            None => Err(Error::NotOpen),
        }
    }

    // ---- Data surface (§6) ----

    pub fn load(&self, iri: &str) -> Result<Loaded> {
        let (canon, query) = Iri::parse_with_query(iri)?;
        if let Some(cached) = self.cache.get(&canon) {
            return Ok(Loaded::Item(cached));
        }
        let loaded = self.with_db(|db| query::load(db, &canon, &query))?;
        if let Loaded::Item(doc) = &loaded {
            self.cache.put(canon, doc.clone());
        }
        Ok(loaded)
    }

    pub fn save(&self, item: Document) -> Result<Document> {
        self.with_db(|db| {
            store::save(
                db,
                self.cache.as_ref(),
                self.config.log_fn.as_ref(),
                self.config.err_fn.as_ref(),
                item,
            )
        })
    }

    /// The single-transaction alternative permitted by §9.
    pub fn save_atomic(&self, item: Document) -> Result<Document> {
        self.with_db_mut(|db| {
            store::save_atomic(
                db,
                self.cache.as_ref(),
                self.config.log_fn.as_ref(),
                self.config.err_fn.as_ref(),
                item,
            )
        })
    }

    pub fn create(&self, collection: Document) -> Result<Document> {
        self.with_db(|db| collections::create(db, &collection))
    }

    pub fn delete(&self, item: &Document) -> Result<()> {
        let iri = item.iri()?;
        self.with_db(|db| store::delete(db, self.cache.as_ref(), &iri))
    }

    pub fn add_to(&self, col_iri: &Iri, item: &Document) -> Result<()> {
        self.with_db(|db| collections::add_to(db, col_iri, item))
    }

    pub fn remove_from(&self, col_iri: &Iri, item: &Document) -> Result<()> {
        self.with_db(|db| collections::remove_from(db, col_iri, item))
    }

    // ---- Security surface (§6) ----

    pub fn password_set(&self, iri: &Iri, pw: &[u8]) -> Result<()> {
        self.with_db(|db| metadata::password_set(db, self.codec.as_ref(), iri, pw))
    }

    pub fn password_check(&self, iri: &Iri, pw: &[u8]) -> Result<()> {
        self.with_db(|db| metadata::password_check(db, self.codec.as_ref(), iri, pw))
    }

    pub fn save_key(&self, iri: &Iri, key: &PrivateKey) -> Result<PublicKey> {
        self.with_db(|db| metadata::save_key(db, self.codec.as_ref(), iri, key))
    }

    pub fn load_key(&self, iri: &Iri) -> Result<PrivateKey> {
        self.with_db(|db| metadata::load_key(db, self.codec.as_ref(), iri))
    }

    pub fn load_metadata(&self, iri: &Iri) -> Result<MetadataRecord> {
        self.with_db(|db| metadata::load_metadata(db, self.codec.as_ref(), iri))
    }

    pub fn save_metadata(&self, iri: &Iri, record: &MetadataRecord) -> Result<()> {
        self.with_db(|db| metadata::save_metadata(db, self.codec.as_ref(), iri, record))
    }

    // ---- OAuth2 surface (§4.9) ----

    pub fn create_client(&self, client: &Client) -> Result<()> {
        self.with_db(|db| {
            oauth::create_client(db, self.codec.as_ref(), self.config.log_fn.as_ref(), client)
        })
    }

    pub fn update_client(&self, client: &Client) -> Result<()> {
        self.with_db(|db| {
            oauth::update_client(db, self.codec.as_ref(), self.config.log_fn.as_ref(), client)
        })
    }

    pub fn get_client(&self, code: &str) -> Result<Client> {
        self.with_db(|db| {
            oauth::get_client(db, self.codec.as_ref(), self.config.log_fn.as_ref(), code)
        })
    }

    pub fn list_clients(&self) -> Result<Vec<Client>> {
        self.with_db(|db| oauth::list_clients(db, self.codec.as_ref(), self.config.log_fn.as_ref()))
    }

    pub fn remove_client(&self, code: &str) -> Result<()> {
        self.with_db(|db| oauth::remove_client(db, self.config.log_fn.as_ref(), code))
    }

    pub fn save_authorize(&self, authorize: &Authorize) -> Result<()> {
        self.with_db(|db| {
            oauth::save_authorize(db, self.codec.as_ref(), self.config.log_fn.as_ref(), authorize)
        })
    }

    pub fn load_authorize(&self, code: &str) -> Result<Authorize> {
        self.with_db(|db| {
            oauth::load_authorize(db, self.codec.as_ref(), self.config.log_fn.as_ref(), code)
        })
    }

    pub fn remove_authorize(&self, code: &str) -> Result<()> {
        self.with_db(|db| oauth::remove_authorize(db, self.config.log_fn.as_ref(), code))
    }

    pub fn save_access(&self, access: &Access) -> Result<()> {
        self.with_db(|db| {
            oauth::save_access(db, self.codec.as_ref(), self.config.log_fn.as_ref(), access)
        })
    }

    pub fn load_access(&self, token: &str) -> Result<Access> {
        self.with_db(|db| {
            oauth::load_access(db, self.codec.as_ref(), self.config.log_fn.as_ref(), token)
        })
    }

    pub fn remove_access(&self, token: &str) -> Result<()> {
        self.with_db(|db| oauth::remove_access(db, self.config.log_fn.as_ref(), token))
    }

    pub fn load_refresh(&self, token: &str) -> Result<Access> {
        self.with_db(|db| {
            oauth::load_refresh(db, self.codec.as_ref(), self.config.log_fn.as_ref(), token)
        })
    }

    pub fn remove_refresh(&self, token: &str) -> Result<()> {
        self.with_db(|db| oauth::remove_refresh(db, self.config.log_fn.as_ref(), token))
    }
}

fn ensure_dir(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::NotValid(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn open_connection(config: &Config) -> Result<Connection> {
    let db = Connection::open(config.sqlite_path())?;
    schema::create_schema(&db)?;
    Ok(db)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn tmp_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        (dir, config)
    }

    #[test]
    fn bootstrap_save_load_actor() {
        let (_dir, config) = tmp_config();
        let repo = Repository::bootstrap(config).unwrap();
        let doc = Document::new(json!({"id": "https://example.com/actors/jdoe", "type": "Person"}));
        repo.save(doc).unwrap();

        match repo.load("https://example.com/actors/jdoe").unwrap() {
            Loaded::Item(d) => assert_eq!(d.id_str(), Some("https://example.com/actors/jdoe")),
            Loaded::Collection(_) => panic!("expected item"),
        }
    }

    #[test]
    fn clean_removes_database_file() {
        let (_dir, config) = tmp_config();
        let repo = Repository::bootstrap(config.clone()).unwrap();
        repo.close();
        assert!(config.sqlite_path().exists());
        Repository::clean(&config).unwrap();
        assert!(!config.sqlite_path().exists());
    }

    #[test]
    fn reset_empties_tables() {
        let (_dir, config) = tmp_config();
        let repo = Repository::bootstrap(config).unwrap();
        let doc = Document::new(json!({"id": "https://example.com/a", "type": "Note"}));
        repo.save(doc).unwrap();
        repo.reset().unwrap();

        assert!(matches!(
            repo.load("https://example.com/a"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn close_then_reopen_on_next_call() {
        let (_dir, config) = tmp_config();
        let repo = Repository::bootstrap(config).unwrap();
        let doc = Document::new(json!({"id": "https://example.com/b", "type": "Note"}));
        repo.save(doc).unwrap();
        repo.close();

        match repo.load("https://example.com/b").unwrap() {
            Loaded::Item(d) => assert_eq!(d.id_str(), Some("https://example.com/b")),
            Loaded::Collection(_) => panic!("expected item"),
        }
    }
}
