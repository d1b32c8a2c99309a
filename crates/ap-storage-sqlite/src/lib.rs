//! SQLite-backed document, collection, metadata and OAuth2 storage engine
//! for a federated ActivityPub server.
//!
//! See `SPEC_FULL.md` at the workspace root for the full component design.
//! The public surface is the `Repository` type in the `repository` module.

pub mod cache;
pub mod codec;
pub mod collections;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod iri;
pub mod metadata;
pub mod oauth;
pub mod query;
pub mod repository;
pub mod schema;
pub mod store;

pub use document::Document;
pub use error::{Error, Result};
pub use iri::Iri;
pub use repository::Repository;
