//! Encrypted node attributes.
//!
//! Attributes are a JSON object prefixed with `MEGA`, zero-padded to the
//! block size and encrypted with AES-CBC under the node's key.

use serde::{Deserialize, Serialize};

use crate::block::{decrypt_cbc, encrypt_cbc, BLOCK_SIZE};
use crate::keys::KEY_LENGTH;
use stowage_common::{Error, Result};

const MAGIC: &[u8] = b"MEGA";

/// Decrypted node attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    /// Node name.
    #[serde(rename = "n")]
    pub name: String,
    /// Attributes this client does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Serialize and encrypt attributes.
pub fn encrypt_attributes(attrs: &NodeAttributes, key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>> {
    let mut plain = MAGIC.to_vec();
    plain.extend_from_slice(&serde_json::to_vec(attrs)?);
    let rem = plain.len() % BLOCK_SIZE;
    if rem != 0 {
        plain.resize(plain.len() + BLOCK_SIZE - rem, 0);
    }
    encrypt_cbc(key, &plain)
}

/// Decrypt and parse attributes.
///
/// # Errors
/// - `Crypto` if the key is wrong (the plaintext lacks the `MEGA{` marker)
pub fn decrypt_attributes(data: &[u8], key: &[u8; KEY_LENGTH]) -> Result<NodeAttributes> {
    let plain = decrypt_cbc(key, data)?;
    let end = plain
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    let plain = &plain[..end];

    if !plain.starts_with(b"MEGA{") {
        return Err(Error::Crypto(
            "Attribute block did not decrypt with the node key".to_string(),
        ));
    }
    serde_json::from_slice(&plain[MAGIC.len()..])
        .map_err(|e| Error::Crypto(format!("Malformed node attributes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_round_trip() {
        let key = [9u8; 16];
        let mut attrs = NodeAttributes::named("report.pdf");
        attrs
            .extra
            .insert("c".to_string(), serde_json::json!("fingerprint"));

        let encrypted = encrypt_attributes(&attrs, &key).unwrap();
        assert_eq!(encrypted.len() % 16, 0);
        assert_eq!(decrypt_attributes(&encrypted, &key).unwrap(), attrs);
    }

    #[test]
    fn test_wrong_key_detected() {
        let encrypted = encrypt_attributes(&NodeAttributes::named("a"), &[1u8; 16]).unwrap();
        assert!(matches!(
            decrypt_attributes(&encrypted, &[2u8; 16]),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_wire_layout() {
        let key = [3u8; 16];
        let encrypted = encrypt_attributes(&NodeAttributes::named("x"), &key).unwrap();
        let plain = decrypt_cbc(&key, &encrypted).unwrap();
        assert!(plain.starts_with(b"MEGA{\"n\":\"x\"}"));
        assert_eq!(plain.len(), 16);
    }
}
