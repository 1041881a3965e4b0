use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoffreError>;

#[derive(Debug, Error)]
pub enum CoffreError {
    #[error("cached is running with a different version ({0})")]
    WrongVersion(String),

    #[error("failed to run cached")]
    FailedToRunAgent,

    #[error("failed to take the lock: {0}")]
    FailedToLock(String),

    #[error("failed to unlock repository")]
    CantUnlock,

    #[error("invalid uuid given \"{requested}\", repository id is \"{actual}\"")]
    UuidMismatch {
        requested: uuid::Uuid,
        actual: uuid::Uuid,
    },

    #[error("failed to verify key")]
    KeyVerification,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("snapshot not found: '{0}'")]
    SnapshotNotFound(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hook error: {0}")]
    Hook(String),

    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}
