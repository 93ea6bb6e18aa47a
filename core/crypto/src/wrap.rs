//! Key wrapping under the master and password keys.

use crate::block::{decrypt_ecb, encrypt_ecb};
use crate::encoding::base64url_encode;
use crate::keys::{MasterKey, NodeKey, PasswordKey};
use rand::RngCore;
use stowage_common::{Error, Result};

/// Wrap a node key for storage on the server.
pub fn wrap_node_key(master: &MasterKey, key: &NodeKey) -> Result<Vec<u8>> {
    encrypt_ecb(master.as_bytes(), &key.to_wire())
}

/// Unwrap a node key fetched from the server.
pub fn unwrap_node_key(master: &MasterKey, wrapped: &[u8]) -> Result<NodeKey> {
    NodeKey::from_unwrapped(&decrypt_ecb(master.as_bytes(), wrapped)?)
}

/// Wrap the master key under the password key.
pub fn wrap_master_key(password_key: &PasswordKey, master: &MasterKey) -> Result<Vec<u8>> {
    encrypt_ecb(password_key.as_bytes(), master.as_bytes())
}

/// Unwrap the master key returned at login.
pub fn unwrap_master_key(password_key: &PasswordKey, wrapped: &[u8]) -> Result<MasterKey> {
    MasterKey::from_slice(&decrypt_ecb(password_key.as_bytes(), wrapped)?)
}

/// Unwrap a block-aligned secret such as the RSA private key.
pub fn unwrap_blob(master: &MasterKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    decrypt_ecb(master.as_bytes(), wrapped)
}

/// Build a temporary session id for an account without an RSA key.
///
/// The id is 16 random bytes followed by their encryption under the master
/// key, so the holder of the master key can check it.
pub fn create_temporary_session(master: &MasterKey) -> Result<Vec<u8>> {
    let mut tsid = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut tsid);
    let check = encrypt_ecb(master.as_bytes(), &tsid)?;
    tsid.extend_from_slice(&check);
    Ok(tsid)
}

/// Validate a temporary session id and return it in wire encoding.
///
/// # Errors
/// - `Authentication` if the id was not made with this master key
pub fn verify_temporary_session(master: &MasterKey, tsid: &[u8]) -> Result<String> {
    if tsid.len() < 32 {
        return Err(Error::Authentication(
            "Temporary session id is too short".to_string(),
        ));
    }
    let check = encrypt_ecb(master.as_bytes(), &tsid[..16])?;
    if check[..] != tsid[16..32] {
        return Err(Error::Authentication(
            "Temporary session id does not match the master key".to_string(),
        ));
    }
    Ok(base64url_encode(tsid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FileKey, FolderKey};

    #[test]
    fn test_node_key_wrapping() {
        let master = MasterKey::generate();
        let file = NodeKey::File(FileKey::new([4u8; 16], [5u8; 8], [6u8; 8]));

        let wrapped = wrap_node_key(&master, &file).unwrap();
        assert_eq!(wrapped.len(), 32);
        match unwrap_node_key(&master, &wrapped).unwrap() {
            NodeKey::File(key) => {
                assert_eq!(key.aes_key(), &[4u8; 16]);
                assert_eq!(key.meta_mac(), &[6u8; 8]);
            }
            NodeKey::Folder(_) => panic!("expected a file key"),
        }

        let folder = NodeKey::Folder(FolderKey::from_bytes([7u8; 16]));
        let wrapped = wrap_node_key(&master, &folder).unwrap();
        assert!(matches!(
            unwrap_node_key(&master, &wrapped).unwrap(),
            NodeKey::Folder(_)
        ));
    }

    #[test]
    fn test_temporary_session() {
        let master = MasterKey::generate();
        let tsid = create_temporary_session(&master).unwrap();

        assert!(verify_temporary_session(&master, &tsid).is_ok());
        assert!(matches!(
            verify_temporary_session(&MasterKey::generate(), &tsid),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_master_key_wrapping() {
        let password_key = PasswordKey::from_bytes([1u8; 16]);
        let master = MasterKey::generate();
        let wrapped = wrap_master_key(&password_key, &master).unwrap();
        let unwrapped = unwrap_master_key(&password_key, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), master.as_bytes());
    }
}
