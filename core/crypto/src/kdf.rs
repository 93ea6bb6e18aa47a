//! Password key derivation for MEGA accounts.
//!
//! Two schemes exist. Version 1 accounts run a 65536-round AES schedule over
//! the password and prove knowledge of it with an email hash. Version 2
//! accounts use PBKDF2-HMAC-SHA512 with a server-provided salt; the second
//! half of the derived bytes is the login hash.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::block::{cipher, encrypt_block, BLOCK_SIZE};
use crate::encoding::base64url_encode;
use crate::keys::{PasswordKey, KEY_LENGTH};
use stowage_common::{Error, Result};

/// PBKDF2 iterations for version 2 accounts.
pub const PBKDF2_ROUNDS: u32 = 100_000;

const V1_ROUNDS: usize = 0x10000;
const V1_HASH_ROUNDS: usize = 0x4000;
const V1_INITIAL_KEY: [u32; 4] = [0x93C4_67E3, 0x7DB0_C7A4, 0xD1BE_3F81, 0x0152_CB56];

/// Password key plus the user hash sent to the server at login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password_key: PasswordKey,
    pub user_hash: String,
}

fn require_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    Ok(())
}

/// Derive the version 1 password key.
///
/// The password is split into 16-byte zero-padded blocks, each used as an
/// AES key to repeatedly encrypt a fixed starting value.
pub fn prepare_key_v1(password: &str) -> Result<PasswordKey> {
    require_password(password)?;

    let bytes = password.as_bytes();
    let ciphers: Vec<_> = bytes
        .chunks(KEY_LENGTH)
        .map(|chunk| {
            let mut block = Zeroizing::new([0u8; KEY_LENGTH]);
            block[..chunk.len()].copy_from_slice(chunk);
            cipher(&block)
        })
        .collect();

    let mut pkey = [0u8; BLOCK_SIZE];
    for (i, word) in V1_INITIAL_KEY.iter().enumerate() {
        pkey[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }

    for _ in 0..V1_ROUNDS {
        for cipher in &ciphers {
            encrypt_block(cipher, &mut pkey);
        }
    }
    Ok(PasswordKey::from_bytes(pkey))
}

/// Version 1 login hash of the (lowercased) email under the password key.
pub fn user_hash_v1(email: &str, key: &PasswordKey) -> String {
    let mut hash = [0u8; BLOCK_SIZE];
    for (i, byte) in email.to_lowercase().bytes().enumerate() {
        hash[i % BLOCK_SIZE] ^= byte;
    }

    let cipher = cipher(key.as_bytes());
    for _ in 0..V1_HASH_ROUNDS {
        encrypt_block(&cipher, &mut hash);
    }

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&hash[0..4]);
    out[4..].copy_from_slice(&hash[8..12]);
    base64url_encode(&out)
}

/// Full version 1 derivation.
pub fn derive_v1(email: &str, password: &str) -> Result<Credentials> {
    let password_key = prepare_key_v1(password)?;
    let user_hash = user_hash_v1(email, &password_key);
    Ok(Credentials {
        password_key,
        user_hash,
    })
}

/// Full version 2 derivation from the account salt.
pub fn derive_v2(password: &str, salt: &[u8]) -> Result<Credentials> {
    require_password(password)?;

    let mut derived = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut derived[..]);

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&derived[..KEY_LENGTH]);
    Ok(Credentials {
        password_key: PasswordKey::from_bytes(key),
        user_hash: base64url_encode(&derived[KEY_LENGTH..]),
    })
}
