//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use stowage_common::{Error, Result};

/// Length of AES-128 keys in bytes.
pub const KEY_LENGTH: usize = 16;

/// Length of the CTR nonce carried in a file key.
pub const NONCE_LENGTH: usize = 8;

/// Length of a packed (wire-format) file key.
pub const PACKED_FILE_KEY_LENGTH: usize = 32;

fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn array_from_slice<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Error::Crypto(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            N,
            bytes.len()
        ))
    })
}

/// Account master key.
///
/// Unwrapped at login with the password key; wraps every node key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a master key from an unwrapped slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_bytes(array_from_slice(bytes, "master key")?))
    }

    /// Generate a random master key.
    pub fn generate() -> Self {
        Self::from_bytes(random_array())
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key derived from the account password, used only to unwrap the master key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey {
    key: [u8; KEY_LENGTH],
}

impl PasswordKey {
    /// Create a password key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PasswordKey([REDACTED])")
    }
}

/// Per-file key: AES key, CTR nonce and the meta-MAC of the content.
///
/// On the wire the three parts are packed into 32 bytes where the first half
/// is the AES key XORed with the second half (`nonce || meta_mac`).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LENGTH],
    nonce: [u8; NONCE_LENGTH],
    meta_mac: [u8; NONCE_LENGTH],
}

impl FileKey {
    /// Assemble a file key from its parts.
    pub fn new(
        key: [u8; KEY_LENGTH],
        nonce: [u8; NONCE_LENGTH],
        meta_mac: [u8; NONCE_LENGTH],
    ) -> Self {
        Self { key, nonce, meta_mac }
    }

    /// Generate a random key and nonce for a new upload.
    ///
    /// The meta-MAC is zero until [`FileKey::with_meta_mac`] is called.
    pub fn generate() -> Self {
        Self::new(random_array(), random_array(), [0u8; NONCE_LENGTH])
    }

    /// Same key and nonce with the meta-MAC computed during upload.
    pub fn with_meta_mac(&self, meta_mac: [u8; NONCE_LENGTH]) -> Self {
        Self::new(self.key, self.nonce, meta_mac)
    }

    /// Unpack a 32-byte wire key.
    ///
    /// # Errors
    /// - Returns error if the slice is not 32 bytes
    pub fn unpack(packed: &[u8]) -> Result<Self> {
        let packed: [u8; PACKED_FILE_KEY_LENGTH] = array_from_slice(packed, "file key")?;
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = packed[i] ^ packed[i + KEY_LENGTH];
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&packed[16..24]);
        let mut meta_mac = [0u8; NONCE_LENGTH];
        meta_mac.copy_from_slice(&packed[24..32]);
        Ok(Self::new(key, nonce, meta_mac))
    }

    /// Pack into the 32-byte wire format.
    pub fn pack(&self) -> [u8; PACKED_FILE_KEY_LENGTH] {
        let mut packed = [0u8; PACKED_FILE_KEY_LENGTH];
        packed[16..24].copy_from_slice(&self.nonce);
        packed[24..32].copy_from_slice(&self.meta_mac);
        for i in 0..KEY_LENGTH {
            packed[i] = self.key[i] ^ packed[i + KEY_LENGTH];
        }
        packed
    }

    /// AES key for content and attributes.
    pub fn aes_key(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// CTR nonce.
    pub fn nonce(&self) -> &[u8; NONCE_LENGTH] {
        &self.nonce
    }

    /// Expected meta-MAC of the plaintext.
    pub fn meta_mac(&self) -> &[u8; NONCE_LENGTH] {
        &self.meta_mac
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey([REDACTED])")
    }
}

/// Key for a folder node; encrypts the folder's attributes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FolderKey {
    key: [u8; KEY_LENGTH],
}

impl FolderKey {
    /// Create a folder key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Generate a random folder key.
    pub fn generate() -> Self {
        Self::from_bytes(random_array())
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderKey([REDACTED])")
    }
}

/// Unwrapped key of a node, by node type.
#[derive(Debug, Clone)]
pub enum NodeKey {
    File(FileKey),
    Folder(FolderKey),
}

impl NodeKey {
    /// Interpret an unwrapped key by its length (32 = file, 16 = folder).
    pub fn from_unwrapped(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            PACKED_FILE_KEY_LENGTH => Ok(NodeKey::File(FileKey::unpack(bytes)?)),
            KEY_LENGTH => Ok(NodeKey::Folder(FolderKey::from_bytes(array_from_slice(
                bytes,
                "folder key",
            )?))),
            other => Err(Error::Crypto(format!("Unexpected node key length: {}", other))),
        }
    }

    /// Wire bytes to wrap under the master key.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            NodeKey::File(key) => key.pack().to_vec(),
            NodeKey::Folder(key) => key.as_bytes().to_vec(),
        }
    }

    /// AES key used for the node's attributes.
    pub fn attribute_key(&self) -> &[u8; KEY_LENGTH] {
        match self {
            NodeKey::File(key) => key.aes_key(),
            NodeKey::Folder(key) => key.as_bytes(),
        }
    }
}
