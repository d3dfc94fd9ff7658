//! migrate-core — live guest-memory migration engine.
//!
//! A pre-copy, iterative, dirty-page streamer with XBZRLE delta compression:
//! a RAM-block registry, dirty-bitmap logging, a rate-limited byte stream, a
//! page codec, and the driver that ties them into a Setup → Iterate →
//! Complete/Cancel state machine. Device models, buses, BIOS/ROM loading,
//! CLI parsing and ACPI tables are external collaborators consumed only
//! through [`handler::SaveStateHandler`], [`ram::RamBlockRegistry`] and
//! [`dirty::DirtyLog`].

pub mod accounting;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dirty;
pub mod driver;
pub mod error;
pub mod handler;
pub mod ram;
pub mod stream;
pub mod timer;

#[cfg(test)]
mod tests;

/// Fixed guest-memory page size in bytes.
pub const PAGE_SIZE: usize = 4096;

pub use accounting::MigrationAccounting;
pub use cache::PageCache;
pub use config::MigrationConfig;
pub use dirty::DirtyLog;
pub use driver::{MigrationDriver, Phase};
pub use error::MigrationError;
pub use handler::{HandlerRegistry, RecvStream, SaveStateHandler, SendStream};
pub use ram::{BlockHandle, RamBlock, RamBlockRegistry};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
