//! Common types shared across Stowage modules.
//!
//! This crate provides the foundational pieces every provider builds on:
//! - the [`BackupEntry`] handle and full-path resolution
//! - the unified [`Error`] taxonomy
//! - cancellation, bounded retry and polling
//! - streaming transfer helpers and progress reporting

pub mod cancel;
pub mod entry;
pub mod error;
pub mod pattern;
pub mod retry;
pub mod transfer;

pub use cancel::CancellationToken;
pub use entry::{BackupEntry, EntryInfo, EntryKind};
pub use error::{Error, Result};
pub use pattern::NamePattern;
pub use retry::{poll_until, PollConfig, PollStatus, RetryConfig, RetryExecutor};
pub use transfer::{
    ByteRange, ByteStream, ChunkReader, ProgressCallback, ProgressTracker, SizedStream,
};
