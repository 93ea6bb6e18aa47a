//! Cryptographic primitives for the MEGA protocol.
//!
//! This module provides:
//! - Password key derivation (legacy AES schedule and PBKDF2-SHA512)
//! - Key wrapping and the packed file-key format
//! - Chunked AES-CTR content encryption with CBC-MAC integrity
//! - Encrypted node attributes
//! - RSA session-id decryption
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - MAC comparison is constant-time

pub mod attributes;
pub mod block;
pub mod encoding;
pub mod kdf;
pub mod keys;
pub mod rsa;
pub mod stream;
pub mod wrap;

pub use attributes::{decrypt_attributes, encrypt_attributes, NodeAttributes};
pub use encoding::{base64url_decode, base64url_encode};
pub use kdf::{derive_v1, derive_v2, Credentials};
pub use keys::{FileKey, FolderKey, MasterKey, NodeKey, PasswordKey};
pub use stream::{chunk_layout, chunk_size, ChunkCipher, RangeDecryptor};
pub use wrap::{
    create_temporary_session, unwrap_blob, unwrap_master_key, unwrap_node_key,
    verify_temporary_session, wrap_master_key, wrap_node_key,
};
