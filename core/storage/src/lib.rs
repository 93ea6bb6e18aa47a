//! Backup service abstraction for Stowage.
//!
//! This crate provides a single async contract, [`BackupService`], over
//! several remote stores (Amazon S3 and Glacier, Azure Blob Storage,
//! Yandex Disk, MEGA) plus an in-memory reference implementation, and a
//! provider registry for resolving services from configuration.
//!
//! # Design Principles
//! - Full-path identity: entries are resolved by their chain of names
//! - Async operations: all I/O is async and cancellable
//! - Streaming support: payloads are never buffered whole
//! - Unified error semantics: consistent error types across providers

pub mod azure;
pub mod glacier;
mod http;
pub mod mega;
pub mod memory;
pub mod registry;
pub mod s3;
pub mod service;
mod sigv4;
#[cfg(test)]
mod testing;
pub mod yandex;

pub use azure::{AzureConfig, AzureService};
pub use glacier::{GlacierConfig, GlacierService, MemoryGlacier};
pub use mega::{MegaConfig, MegaService};
pub use memory::MemoryService;
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};
pub use s3::{S3Config, S3Service};
pub use service::{BackupService, EntryStream, ProviderKind};
pub use sigv4::AwsCredentials;
pub use yandex::{YandexConfig, YandexService};
