//! Amazon S3 backup service.
//!
//! Objects are addressed by their full path used as the key. Folders are
//! implicit: listing uses a `/` delimiter and common prefixes become folder
//! entries.
//!
//! - Requests are SigV4-signed with `UNSIGNED-PAYLOAD`, so uploads stream
//! - Payloads above the multipart threshold go through a multipart upload
//! - Publishing grants `public-read`; `unpublish` restores `private` and
//!   waits until anonymous reads are refused. Expiring links are not
//!   supported.

pub mod client;
pub mod service;

pub use client::S3Client;
pub use service::{create_s3_service, S3Config, S3Service};
