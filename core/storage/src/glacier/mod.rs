//! Amazon Glacier backup service.
//!
//! Glacier stores immutable archives in a vault and has no listing call:
//! the archive list comes from an asynchronous inventory job. Each archive
//! description holds the full path of the entry it stores, so the service
//! rebuilds the hierarchy from the inventory.
//!
//! - Inventory is fetched lazily, cached per instance and patched with a
//!   journal of this instance's uploads and deletes
//! - Several archives may share a path; the newest one wins
//! - Downloads go through archive-retrieval jobs

pub mod api;
pub mod client;
pub mod inventory;
pub mod job;
pub mod memory;
pub mod service;
pub mod tree_hash;

pub use api::{GlacierApi, JobDescription, JobRequest, JobStatus};
pub use client::GlacierClient;
pub use inventory::{decode_description, encode_description, ArchiveIndex, ArchiveRecord, Inventory};
pub use memory::MemoryGlacier;
pub use service::{create_glacier_service, GlacierConfig, GlacierOptions, GlacierService};
