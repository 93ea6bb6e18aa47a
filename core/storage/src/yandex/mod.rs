//! Yandex Disk backup service.
//!
//! Talks to the Yandex Disk REST API with an OAuth token. Uploads and
//! downloads go through short-lived links issued by the API; deletes and
//! publication changes may complete asynchronously and are polled.

pub mod client;
pub mod service;

pub use client::YandexClient;
pub use service::{create_yandex_service, YandexConfig, YandexService};
