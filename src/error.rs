use thiserror::Error;

/// Every error kind surfaced to callers. `NotFound` is deliberately absent:
/// `get`/`delete` report an absent key through `Option`/`bool`, not `Err`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key violates width/sign constraints")]
    InvalidKey,

    #[error("value length {0} exceeds the maximum representable length")]
    ValueTooLarge(u64),

    #[error("corrupt page {page}: {reason}")]
    CorruptPage { page: u32, reason: String },

    #[error("free list is corrupt: {0}")]
    CorruptFreeList(String),

    #[error("write-ahead log is corrupt: {0}")]
    CorruptWal(String),

    #[error("overflow chain truncated: expected {expected} bytes, got {got}")]
    TruncatedChain { expected: u64, got: u64 },

    #[error("buffer pool exhausted: all frames pinned")]
    PoolExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("lock misuse: {0}")]
    LockMisuse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
