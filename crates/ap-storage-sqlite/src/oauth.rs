//! OAuth2 Store (§4.9): clients, authorization codes, access tokens, and
//! refresh tokens, with chained fetches and expiry checks.

use crate::codec::Codec;
use crate::config::LogSink;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::time::{Duration, Instant};

/// §4.9 "UserData column": a freeform blob, coerced to bytes before write.
#[derive(Debug, Clone, PartialEq)]
pub enum UserData {
    Str(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl UserData {
    fn to_bytes(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        match self {
            UserData::Str(s) => Ok(s.clone().into_bytes()),
            UserData::Bytes(b) => Ok(b.clone()),
            UserData::Json(v) => codec.encode(v),
        }
    }

    fn from_bytes(bytes: &[u8], codec: &dyn Codec) -> UserData {
        if let Ok(value) = codec.decode(bytes) {
            return UserData::Json(value);
        }
        match std::str::from_utf8(bytes) {
            Ok(s) => UserData::Str(s.to_string()),
            Err(_) => UserData::Bytes(bytes.to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub code: String,
    pub secret: String,
    pub redirect_uri: String,
    pub extra: Option<UserData>,
}

#[derive(Debug, Clone)]
pub struct Authorize {
    pub client: String,
    pub code: String,
    pub expires_in: i64,
    pub scope: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub extra: Option<UserData>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Populated by `load_authorize`'s chained fetch; `None` if the client
    /// row is missing (swallowed per §7).
    pub client_record: Option<Client>,
}

#[derive(Debug, Clone)]
pub struct Access {
    pub client: String,
    pub authorize: Option<String>,
    pub previous: Option<String>,
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
    pub redirect_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub extra: Option<UserData>,
    pub client_record: Option<Client>,
    pub authorize_record: Option<Box<Authorize>>,
    pub previous_record: Option<Box<Access>>,
}

/// Every call wraps its statement with a 1s soft deadline (§4.9); since
/// `rusqlite` is synchronous, this is diagnostic classification rather than
/// true preemptive cancellation (the engine's own 5s busy-timeout still
/// governs the underlying statement).
const OAUTH_DEADLINE: Duration = Duration::from_secs(1);

fn with_deadline<T>(log_fn: Option<&LogSink>, op: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = op();
    if start.elapsed() > OAUTH_DEADLINE {
        tracing::warn!("oauth2 statement exceeded its 1s soft deadline");
        if let Some(sink) = log_fn {
            sink(format_args!("oauth2 statement exceeded its 1s soft deadline"));
        }
    }
    result
}

fn extra_to_bytes(extra: &Option<UserData>, codec: &dyn Codec) -> Result<Option<Vec<u8>>> {
    extra.as_ref().map(|u| u.to_bytes(codec)).transpose()
}

pub fn create_client(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    client: &Client,
) -> Result<()> {
    with_deadline(log_fn, || {
        let extra = extra_to_bytes(&client.extra, codec)?;
        db.execute(
            "INSERT INTO clients (code, secret, redirect_uri, extra) VALUES (?, ?, ?, ?)",
            params![client.code, client.secret, client.redirect_uri, extra],
        )?;
        Ok(())
    })
}

pub fn update_client(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    client: &Client,
) -> Result<()> {
    with_deadline(log_fn, || {
        let extra = extra_to_bytes(&client.extra, codec)?;
        let affected = db.execute(
            "UPDATE clients SET secret = ?, redirect_uri = ?, extra = ? WHERE code = ?",
            params![client.secret, client.redirect_uri, extra, client.code],
        )?;
        if affected == 0 {
            return Err(Error::NotFound(format!("client {}", client.code)));
        }
        Ok(())
    })
}

pub fn get_client(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    code: &str,
) -> Result<Client> {
    with_deadline(log_fn, || {
        row_to_client(db, codec, code)?.ok_or_else(|| Error::NotFound(format!("client {code}")))
    })
}

pub fn list_clients(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
) -> Result<Vec<Client>> {
    with_deadline(log_fn, || {
        let mut stmt = db.prepare("SELECT code, secret, redirect_uri, extra FROM clients")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (code, secret, redirect_uri, extra) = row?;
            out.push(Client {
                code,
                secret,
                redirect_uri,
                extra: extra.map(|b| UserData::from_bytes(&b, codec)),
            });
        }
        Ok(out)
    })
}

pub fn remove_client(db: &Connection, log_fn: Option<&LogSink>, code: &str) -> Result<()> {
    with_deadline(log_fn, || {
        db.execute("DELETE FROM clients WHERE code = ?", params![code])?;
        Ok(())
    })
}

fn row_to_client(db: &Connection, codec: &dyn Codec, code: &str) -> Result<Option<Client>> {
    let row: Option<(String, String, String, Option<Vec<u8>>)> = db
        .query_row(
            "SELECT code, secret, redirect_uri, extra FROM clients WHERE code = ?",
            params![code],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    Ok(row.map(|(code, secret, redirect_uri, extra)| Client {
        code,
        secret,
        redirect_uri,
        extra: extra.map(|b| UserData::from_bytes(&b, codec)),
    }))
}

pub fn save_authorize(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    authorize: &Authorize,
) -> Result<()> {
    with_deadline(log_fn, || {
        let extra = extra_to_bytes(&authorize.extra, codec)?;
        db.execute(
            "INSERT OR REPLACE INTO authorize (client, code, expires_in, scope, redirect_uri, state, created_at, extra, code_challenge, code_challenge_method) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                authorize.client,
                authorize.code,
                authorize.expires_in,
                authorize.scope,
                authorize.redirect_uri,
                authorize.state,
                authorize.created_at.to_rfc3339(),
                extra,
                authorize.code_challenge,
                authorize.code_challenge_method,
            ],
        )?;
        Ok(())
    })
}

/// `load_authorize` (§4.9): rejects (unauthorized) an expired code; chains
/// a `client` fetch that is swallowed (left `None`) on not-found (§7).
pub fn load_authorize(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    code: &str,
) -> Result<Authorize> {
    with_deadline(log_fn, || {
        let row: Option<(String, String, i64, Option<String>, Option<String>, Option<String>, String, Option<Vec<u8>>, Option<String>, Option<String>)> = db
            .query_row(
                "SELECT client, code, expires_in, scope, redirect_uri, state, created_at, extra, code_challenge, code_challenge_method FROM authorize WHERE code = ?",
                params![code],
                |r| {
                    Ok((
                        r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?,
                        r.get(5)?, r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((client, code, expires_in, scope, redirect_uri, state, created_at, extra, code_challenge, code_challenge_method)) = row else {
            return Err(Error::NotFound(format!("authorize code {code}")));
        };
        let created_at = parse_rfc3339(&created_at)?;
        check_not_expired(created_at, expires_in)?;

        let client_record = row_to_client(db, codec, &client).ok().flatten();
        Ok(Authorize {
            client,
            code,
            expires_in,
            scope,
            redirect_uri,
            state,
            created_at,
            extra: extra.map(|b| UserData::from_bytes(&b, codec)),
            code_challenge,
            code_challenge_method,
            client_record,
        })
    })
}

pub fn remove_authorize(db: &Connection, log_fn: Option<&LogSink>, code: &str) -> Result<()> {
    with_deadline(log_fn, || {
        db.execute("DELETE FROM authorize WHERE code = ?", params![code])?;
        Ok(())
    })
}

pub fn save_access(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    access: &Access,
) -> Result<()> {
    with_deadline(log_fn, || {
        let extra = extra_to_bytes(&access.extra, codec)?;
        db.execute(
            "INSERT OR REPLACE INTO access (client, authorize, previous, token, refresh_token, expires_in, scope, redirect_uri, created_at, extra) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                access.client,
                access.authorize,
                access.previous,
                access.token,
                access.refresh_token,
                access.expires_in,
                access.scope,
                access.redirect_uri,
                access.created_at.to_rfc3339(),
                extra,
            ],
        )?;
        if let Some(refresh_token) = &access.refresh_token {
            db.execute(
                "INSERT OR REPLACE INTO refresh (access_token, token) VALUES (?, ?)",
                params![access.token, refresh_token],
            )?;
        }
        Ok(())
    })
}

/// `load_access` (§4.9): rejects expired tokens, and transitively resolves
/// `client`, `authorize` and `previous` (recursively), each swallowed to
/// `None` on not-found.
pub fn load_access(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    token: &str,
) -> Result<Access> {
    with_deadline(log_fn, || load_access_inner(db, codec, log_fn, token))
}

fn load_access_inner(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    token: &str,
) -> Result<Access> {
    let row: Option<(String, Option<String>, Option<String>, String, Option<String>, i64, Option<String>, Option<String>, String, Option<Vec<u8>>)> = db
        .query_row(
            "SELECT client, authorize, previous, token, refresh_token, expires_in, scope, redirect_uri, created_at, extra FROM access WHERE token = ?",
            params![token],
            |r| {
                Ok((
                    r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?,
                    r.get(5)?, r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?,
                ))
            },
        )
        .optional()?;
    let Some((client, authorize, previous, token, refresh_token, expires_in, scope, redirect_uri, created_at, extra)) = row else {
        return Err(Error::NotFound(format!("access token {token}")));
    };
    let created_at = parse_rfc3339(&created_at)?;
    check_not_expired(created_at, expires_in)?;

    let client_record = row_to_client(db, codec, &client).ok().flatten();
    let authorize_record = authorize
        .as_ref()
        .and_then(|code| load_authorize(db, codec, log_fn, code).ok())
        .map(Box::new);
    let previous_record = previous
        .as_ref()
        .and_then(|prev_token| load_access_inner(db, codec, log_fn, prev_token).ok())
        .map(Box::new);

    Ok(Access {
        client,
        authorize,
        previous,
        token,
        refresh_token,
        expires_in,
        scope,
        redirect_uri,
        created_at,
        extra: extra.map(|b| UserData::from_bytes(&b, codec)),
        client_record,
        authorize_record,
        previous_record,
    })
}

pub fn remove_access(db: &Connection, log_fn: Option<&LogSink>, token: &str) -> Result<()> {
    with_deadline(log_fn, || {
        db.execute("DELETE FROM access WHERE token = ?", params![token])?;
        Ok(())
    })
}

/// `load_refresh` (§4.9): reads the `access_token` pointer and returns
/// `load_access` of that token.
pub fn load_refresh(
    db: &Connection,
    codec: &dyn Codec,
    log_fn: Option<&LogSink>,
    token: &str,
) -> Result<Access> {
    with_deadline(log_fn, || {
        let access_token: Option<String> = db
            .query_row(
                "SELECT access_token FROM refresh WHERE token = ?",
                params![token],
                |r| r.get(0),
            )
            .optional()?;
        let access_token =
            access_token.ok_or_else(|| Error::NotFound(format!("refresh token {token}")))?;
        load_access_inner(db, codec, log_fn, &access_token)
    })
}

pub fn remove_refresh(db: &Connection, log_fn: Option<&LogSink>, token: &str) -> Result<()> {
    with_deadline(log_fn, || {
        db.execute("DELETE FROM refresh WHERE token = ?", params![token])?;
        Ok(())
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::NotValid(format!("created_at: {e}")))
}

fn check_not_expired(created_at: DateTime<Utc>, expires_in: i64) -> Result<()> {
    let expiry = created_at + chrono::Duration::seconds(expires_in);
    if expiry < Utc::now() {
        return Err(Error::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::schema::create_schema;

    fn setup() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        db
    }

    fn sample_client() -> Client {
        Client {
            code: "c1".into(),
            secret: "s".into(),
            redirect_uri: "/cb".into(),
            extra: None,
        }
    }

    #[test]
    fn oauth2_lifecycle() {
        let db = setup();
        let codec = JsonCodec;
        create_client(&db, &codec, None, &sample_client()).unwrap();

        let authorize = Authorize {
            client: "c1".into(),
            code: "AC1".into(),
            expires_in: 666,
            scope: None,
            redirect_uri: None,
            state: None,
            created_at: Utc::now(),
            extra: None,
            code_challenge: None,
            code_challenge_method: None,
            client_record: None,
        };
        save_authorize(&db, &codec, None, &authorize).unwrap();

        let loaded = load_authorize(&db, &codec, None, "AC1").unwrap();
        assert_eq!(loaded.client_record.unwrap().code, "c1");

        remove_authorize(&db, None, "AC1").unwrap();
        assert!(matches!(
            load_authorize(&db, &codec, None, "AC1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn expired_authorize_is_unauthorized() {
        let db = setup();
        let codec = JsonCodec;
        create_client(&db, &codec, None, &sample_client()).unwrap();
        let authorize = Authorize {
            client: "c1".into(),
            code: "AC2".into(),
            expires_in: 1,
            scope: None,
            redirect_uri: None,
            state: None,
            created_at: Utc::now() - chrono::Duration::seconds(60),
            extra: None,
            code_challenge: None,
            code_challenge_method: None,
            client_record: None,
        };
        save_authorize(&db, &codec, None, &authorize).unwrap();
        assert!(matches!(
            load_authorize(&db, &codec, None, "AC2"),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn refresh_token_resolves_through_access() {
        let db = setup();
        let codec = JsonCodec;
        create_client(&db, &codec, None, &sample_client()).unwrap();
        let access = Access {
            client: "c1".into(),
            authorize: None,
            previous: None,
            token: "AT1".into(),
            refresh_token: Some("RT1".into()),
            expires_in: 3600,
            scope: None,
            redirect_uri: None,
            created_at: Utc::now(),
            extra: None,
            client_record: None,
            authorize_record: None,
            previous_record: None,
        };
        save_access(&db, &codec, None, &access).unwrap();

        let via_refresh = load_refresh(&db, &codec, None, "RT1").unwrap();
        assert_eq!(via_refresh.token, "AT1");
    }

    #[test]
    fn deadline_warning_reaches_log_sink() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let fired = StdArc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let log_fn: LogSink = StdArc::new(move |_args| {
            fired2.store(true, Ordering::SeqCst);
        });

        let result = with_deadline(Some(&log_fn), || {
            std::thread::sleep(Duration::from_millis(1100));
            Ok(())
        });
        assert!(result.is_ok());
        assert!(fired.load(Ordering::SeqCst));
    }
}
