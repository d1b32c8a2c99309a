use thiserror::Error;

/// Errors raised by the storage engine.
///
/// Variants map directly onto the error taxonomy a caller needs to branch on
/// (not-found vs unauthorized vs a hard storage fault); everything else is
/// bubbled up annotated with a short tag.
#[derive(Error, Debug)]
pub enum Error {
    #[error("repository is not open")]
    NotOpen,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not valid: {0}")]
    NotValid(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage fault: {0}")]
    StorageFault(#[from] rusqlite::Error),

    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid IRI: {0}")]
    Iri(#[from] url::ParseError),

    #[error("nil argument: {0}")]
    NilArgument(String),

    #[error("{0} is already present")]
    AlreadyPresent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
