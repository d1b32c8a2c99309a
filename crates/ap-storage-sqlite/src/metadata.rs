//! Metadata Store (§4.8): per-IRI side-band blob holding a password hash
//! and/or a PKCS#8 private key, plus the bcrypt and key-codec glue.

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::iri::{classify, Iri};
use dsa::pkcs8::{EncodePrivateKey as DsaEncodePrivate, LineEnding};
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// The opaque `meta` column blob (§3 "Metadata Entity").
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pw: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A PKCS#8-decoded private key, over the four algorithms the source names
/// (§9 "Decided — PKCS#8 key algorithm support").
#[derive(Debug)]
pub enum PrivateKey {
    Rsa(Box<rsa::RsaPrivateKey>),
    EcdsaP256(Box<p256::ecdsa::SigningKey>),
    Ed25519(Box<ed25519_dalek::SigningKey>),
    Dsa(Box<dsa::SigningKey>),
}

/// A derived public key, PKIX-PEM-encoded, ready to embed in an actor's
/// `publicKey` field (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub pem: String,
}

fn host_table(iri: &Iri) -> &'static str {
    classify(iri).table.name()
}

/// `load_metadata(iri)` (§4.8): route to host table, select the `meta`
/// blob, and decode it with the injected codec. An absent/empty blob is
/// not-found.
pub fn load_metadata(db: &Connection, codec: &dyn Codec, iri: &Iri) -> Result<MetadataRecord> {
    let table = host_table(iri);
    let blob: Option<Vec<u8>> = db
        .query_row(
            &format!("SELECT meta FROM {table} WHERE iri = ?"),
            params![iri.as_str()],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    match blob {
        Some(bytes) if !bytes.is_empty() => {
            let value = codec.decode(&bytes)?;
            Ok(serde_json::from_value(value).map_err(Error::from)?)
        }
        _ => Err(Error::NotFound(format!("metadata for {iri}"))),
    }
}

fn load_metadata_or_default(db: &Connection, codec: &dyn Codec, iri: &Iri) -> Result<MetadataRecord> {
    match load_metadata(db, codec, iri) {
        Ok(m) => Ok(m),
        Err(Error::NotFound(_)) => Ok(MetadataRecord::default()),
        Err(e) => Err(e),
    }
}

/// `save_metadata(iri, bytes)` (§4.8): the host row must pre-exist.
/// Encoded with the injected codec.
pub fn save_metadata(db: &Connection, codec: &dyn Codec, iri: &Iri, record: &MetadataRecord) -> Result<()> {
    let table = host_table(iri);
    let value = serde_json::to_value(record)?;
    let bytes = codec.encode(&value)?;
    let affected = db.execute(
        &format!("UPDATE {table} SET meta = ? WHERE iri = ?"),
        params![bytes, iri.as_str()],
    )?;
    if affected == 0 {
        return Err(Error::NotFound(format!("host row for {iri}")));
    }
    Ok(())
}

/// Bcrypt's own input-length ceiling; checked explicitly so the error is
/// actionable (§4.8).
const BCRYPT_MAX_PASSWORD_LEN: usize = 72;

/// `password_set(iri, pw)` (§4.8).
pub fn password_set(db: &Connection, codec: &dyn Codec, iri: &Iri, pw: &[u8]) -> Result<()> {
    if pw.len() > BCRYPT_MAX_PASSWORD_LEN {
        return Err(Error::NotValid("password too long".into()));
    }
    let hash = bcrypt::hash(pw, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::NotValid(format!("bcrypt: {e}")))?;
    let mut record = load_metadata_or_default(db, codec, iri)?;
    record.pw = Some(hash.into_bytes());
    save_metadata(db, codec, iri, &record)
}

/// `password_check(iri, pw)` (§4.8): wrong password → unauthorized.
pub fn password_check(db: &Connection, codec: &dyn Codec, iri: &Iri, pw: &[u8]) -> Result<()> {
    let record = load_metadata(db, codec, iri)?;
    let hash = record
        .pw
        .ok_or_else(|| Error::NotFound(format!("password for {iri}")))?;
    let hash = String::from_utf8(hash).map_err(|_| Error::Unauthorized)?;
    let ok = bcrypt::verify(pw, &hash).map_err(|_| Error::Unauthorized)?;
    if ok {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// `save_key(iri, priv)` (§4.8): PKCS#8-encode, store, derive the public
/// key, PKIX-PEM-encode, return the `PublicKey` record.
pub fn save_key(db: &Connection, codec: &dyn Codec, iri: &Iri, key: &PrivateKey) -> Result<PublicKey> {
    let mut record = load_metadata_or_default(db, codec, iri)?;
    if record.key.is_some() {
        // Soft failure (§7 "already-present"): logged, not fatal.
        tracing::warn!(iri = %iri, "actor already has a private key; overwriting");
    }

    let (pem, public_pem) = match key {
        PrivateKey::Rsa(k) => {
            let pem = k
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkcs8 encode: {e}")))?
                .to_string();
            let public = rsa::RsaPublicKey::from(k.as_ref());
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkix encode: {e}")))?;
            (pem, public_pem)
        }
        PrivateKey::EcdsaP256(k) => {
            let pem = k
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkcs8 encode: {e}")))?
                .to_string();
            let public = p256::ecdsa::VerifyingKey::from(k.as_ref());
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkix encode: {e}")))?;
            (pem, public_pem)
        }
        PrivateKey::Ed25519(k) => {
            let pem = k
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkcs8 encode: {e}")))?
                .to_string();
            let public = k.verifying_key();
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkix encode: {e}")))?;
            (pem, public_pem)
        }
        PrivateKey::Dsa(k) => {
            let pem = k
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkcs8 encode: {e}")))?
                .to_string();
            let public = k.verifying_key();
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::NotValid(format!("pkix encode: {e}")))?;
            (pem, public_pem)
        }
    };

    record.key = Some(pem);
    save_metadata(db, codec, iri, &record)?;

    Ok(PublicKey {
        id: format!("{iri}#main"),
        owner: iri.to_string(),
        pem: public_pem,
    })
}

/// `load_key(iri)` (§4.8): decode the stored PEM, trying each supported
/// algorithm's PKCS#8 decoder in turn.
pub fn load_key(db: &Connection, codec: &dyn Codec, iri: &Iri) -> Result<PrivateKey> {
    let record = load_metadata(db, codec, iri)?;
    let pem = record
        .key
        .ok_or_else(|| Error::NotFound(format!("private key for {iri}")))?;

    if let Ok(k) = rsa::RsaPrivateKey::from_pkcs8_pem(&pem) {
        return Ok(PrivateKey::Rsa(Box::new(k)));
    }
    if let Ok(k) = p256::ecdsa::SigningKey::from_pkcs8_pem(&pem) {
        return Ok(PrivateKey::EcdsaP256(Box::new(k)));
    }
    if let Ok(k) = ed25519_dalek::SigningKey::from_pkcs8_pem(&pem) {
        return Ok(PrivateKey::Ed25519(Box::new(k)));
    }
    if let Ok(k) = dsa::SigningKey::from_pkcs8_pem(&pem) {
        return Ok(PrivateKey::Dsa(Box::new(k)));
    }
    Err(Error::NotValid("unrecognized private key type".into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::schema::create_schema;
    use ed25519_dalek::pkcs8::EncodePrivateKey;

    fn setup_with_actor(iri_str: &str) -> (Connection, Iri) {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        db.execute(
            &format!(
                "INSERT INTO actors (raw) VALUES ('{{\"id\":\"{iri_str}\",\"type\":\"Person\"}}')"
            ),
            [],
        )
        .unwrap();
        (db, Iri::parse(iri_str).unwrap())
    }

    #[test]
    fn password_round_trip() {
        let (db, iri) = setup_with_actor("https://example.com/actors/jdoe");
        let codec = JsonCodec;
        password_set(&db, &codec, &iri, b"secret").unwrap();
        password_check(&db, &codec, &iri, b"secret").unwrap();
        assert!(matches!(
            password_check(&db, &codec, &iri, b"other"),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn password_too_long_is_rejected() {
        let (db, iri) = setup_with_actor("https://example.com/actors/jdoe2");
        let codec = JsonCodec;
        let long = vec![b'a'; 73];
        assert!(matches!(
            password_set(&db, &codec, &iri, &long),
            Err(Error::NotValid(_))
        ));
    }

    #[test]
    fn ed25519_key_round_trip() {
        let (db, iri) = setup_with_actor("https://example.com/actors/jdoe3");
        let codec = JsonCodec;
        let mut rng = rand::rngs::OsRng;
        let signing = ed25519_dalek::SigningKey::generate(&mut rng);
        let pub_key = save_key(&db, &codec, &iri, &PrivateKey::Ed25519(Box::new(signing.clone())))
            .unwrap();
        assert_eq!(pub_key.id, format!("{iri}#main"));

        let loaded = load_key(&db, &codec, &iri).unwrap();
        match loaded {
            PrivateKey::Ed25519(k) => {
                assert_eq!(
                    k.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
                    signing.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
                );
            }
            _ => panic!("expected Ed25519 key"),
        }
    }

    #[test]
    fn metadata_requires_existing_host_row() {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        let codec = JsonCodec;
        let iri = Iri::parse("https://example.com/actors/ghost").unwrap();
        let record = MetadataRecord {
            pw: Some(vec![1, 2, 3]),
            key: None,
        };
        assert!(matches!(
            save_metadata(&db, &codec, &iri, &record),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn failing_codec_surfaces_on_save_metadata() {
        use crate::codec::Codec;
        use serde_json::Value;

        #[derive(Debug)]
        struct FailingCodec;
        impl Codec for FailingCodec {
            fn encode(&self, _value: &Value) -> Result<Vec<u8>> {
                Err(Error::NotValid("codec always fails".into()))
            }
            fn decode(&self, _bytes: &[u8]) -> Result<Value> {
                Err(Error::NotValid("codec always fails".into()))
            }
        }

        let (db, iri) = setup_with_actor("https://example.com/actors/jdoe4");
        let record = MetadataRecord {
            pw: Some(vec![1, 2, 3]),
            key: None,
        };
        assert!(matches!(
            save_metadata(&db, &FailingCodec, &iri, &record),
            Err(Error::NotValid(_))
        ));
    }
}
