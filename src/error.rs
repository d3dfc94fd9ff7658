//! Crate-wide error types.
//!
//! Mirrors the error taxonomy of the migration core: a registry-scoped enum
//! for `id` conflicts, plus the top-level `MigrationError` every public
//! operation returns.

/// Errors raised by the RAM-block registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate RAM block id: {0}")]
    DuplicateId(String),

    #[error("unknown RAM block id: {0}")]
    UnknownBlock(String),
}

/// Errors raised by the XBZRLE page cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

/// Top-level error surfaced by every driver and codec operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MigrationError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Underlying sink/source returned an error; the stream becomes inert.
    #[error("stream I/O error: {0}")]
    StreamIo(String),

    /// Malformed wire data on load: bad version, unknown block, bad sub-flag.
    #[error("invalid migration stream: {0}")]
    InvalidStream(String),

    /// XBZRLE decode would have written past the page boundary.
    #[error("xbzrle decode overflow: {decoded} bytes exceeds page size {page_size}")]
    DecodeOverflow { decoded: usize, page_size: usize },
}

impl MigrationError {
    /// Stream errors and invalid-stream errors are fatal for the current
    /// transfer; the driver must transition to `Cancelled` on either.
    pub fn is_fatal_for_transfer(&self) -> bool {
        matches!(
            self,
            MigrationError::StreamIo(_)
                | MigrationError::InvalidStream(_)
                | MigrationError::DecodeOverflow { .. }
        )
    }
}
