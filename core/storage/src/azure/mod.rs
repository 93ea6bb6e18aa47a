//! Azure Blob Storage backup service.
//!
//! Requests are authenticated with the account's Shared Key. Small
//! payloads go up in a single streaming Put Blob; larger ones are staged as
//! blocks and committed with Put Block List.

pub mod auth;
pub mod client;
pub mod service;

pub use auth::SharedKey;
pub use client::AzureClient;
pub use service::{create_azure_service, AzureConfig, AzureService};
