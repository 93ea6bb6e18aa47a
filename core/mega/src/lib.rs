//! Client for MEGA's end-to-end encrypted storage protocol.
//!
//! All content and names are encrypted client-side; the server only sees
//! ciphertext and wrapped keys. [`MegaClient`] owns the session and a
//! cached snapshot of the node tree. Requests go through an
//! [`ApiTransport`], which is either [`HttpTransport`] or the
//! [`MemoryMegaServer`] used in tests.

pub mod api;
pub mod client;
pub mod error;
pub mod links;
pub mod memory;
pub mod nodes;
pub mod session;
mod transfer;
pub mod transport;

pub use client::{ClientOptions, MegaClient, PublicFile};
pub use links::{LinkKind, PublicLink, DEFAULT_LINK_BASE};
pub use memory::MemoryMegaServer;
pub use nodes::{Node, NodeKind, NodeTree};
pub use session::SessionStatus;
pub use transport::{ApiTransport, HttpTransport, DEFAULT_API_URL};
