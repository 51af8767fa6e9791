use thiserror::Error;

use crate::codec::CodecError;

/// Main error type for crawldex operations
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Corrupt record ({context}) at offset {offset}")]
    CorruptRecord { context: &'static str, offset: u64 },

    #[error("Invalid document key block: length {0} is not a multiple of 8")]
    InvalidKeyLength(usize),

    #[error("Bad shard header: {0}")]
    ShardHeader(String),

    #[error("Dictionary state error: {0}")]
    DictionaryState(String),

    #[error("Generation {0} exceeds the supported maximum {max}", max = crate::shard::MAX_GENERATION)]
    GenerationOverflow(u32),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for crawldex operations
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Check if this error indicates on-disk damage that a reader may
    /// skip past, as opposed to a caller mistake or a dead filesystem
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IndexError::Codec(_) | IndexError::CorruptRecord { .. }
        )
    }
}
