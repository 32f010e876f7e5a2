use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The file is not a burrow database, or was written by an
    /// incompatible version.
    #[error("invalid database: bad magic, version or checksum")]
    Invalid,
    #[error("database file is corrupted")]
    Corrupted,
    #[error("transaction has already been committed or rolled back")]
    TxClosed,
    #[error("transaction is read-only")]
    TxReadOnly,
    #[error("database was opened read-only")]
    DatabaseReadOnly,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("bucket already exists")]
    BucketExists,
    #[error("bucket name required")]
    BucketNameRequired,
    #[error("key required")]
    KeyRequired,
    #[error("key too large")]
    KeyTooLarge,
    #[error("value too large")]
    ValueTooLarge,
    /// Raised when a value operation lands on a key that names a bucket,
    /// or a bucket operation lands on a plain value.
    #[error("incompatible value")]
    IncompatibleValue,
    #[error("timed out waiting for the file lock")]
    LockTimeout,
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}
