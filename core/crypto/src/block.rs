//! AES-128 block modes used by the MEGA protocol.
//!
//! Key wrapping is raw ECB over 16-byte blocks; attributes use CBC with a
//! zero IV. Neither mode pads, so callers supply block-aligned input.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};

use crate::keys::KEY_LENGTH;
use stowage_common::{Error, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

pub(crate) fn cipher(key: &[u8; KEY_LENGTH]) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key))
}

pub(crate) fn encrypt_block(cipher: &Aes128, block: &mut [u8; BLOCK_SIZE]) {
    let mut buf = Block::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    block.copy_from_slice(&buf);
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Crypto(format!(
            "Input of {} bytes is not a multiple of the AES block size",
            data.len()
        )));
    }
    Ok(())
}

/// Encrypt block-aligned data in ECB mode.
pub fn encrypt_ecb(key: &[u8; KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>> {
    check_aligned(data)?;
    let cipher = cipher(key);
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Decrypt block-aligned data in ECB mode.
pub fn decrypt_ecb(key: &[u8; KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>> {
    check_aligned(data)?;
    let cipher = cipher(key);
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Encrypt block-aligned data in CBC mode with a zero IV.
pub fn encrypt_cbc(key: &[u8; KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>> {
    check_aligned(data)?;
    let cipher = cipher(key);
    let mut prev = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_SIZE {
            block[i] = chunk[i] ^ prev[i];
        }
        encrypt_block(&cipher, &mut block);
        out.extend_from_slice(&block);
        prev = block;
    }
    Ok(out)
}

/// Decrypt block-aligned data in CBC mode with a zero IV.
pub fn decrypt_cbc(key: &[u8; KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>> {
    check_aligned(data)?;
    let cipher = cipher(key);
    let mut prev = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(BLOCK_SIZE) {
        let mut block = Block::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for i in 0..BLOCK_SIZE {
            out.push(block[i] ^ prev[i]);
        }
        prev.copy_from_slice(chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix C.1
    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const PLAIN: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];
    const CIPHER: [u8; 16] = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5,
        0x5a,
    ];

    #[test]
    fn test_ecb_known_vector() {
        assert_eq!(encrypt_ecb(&KEY, &PLAIN).unwrap(), CIPHER);
        assert_eq!(decrypt_ecb(&KEY, &CIPHER).unwrap(), PLAIN);
    }

    #[test]
    fn test_cbc_first_block_matches_ecb() {
        let mut data = PLAIN.to_vec();
        data.extend_from_slice(&PLAIN);

        let encrypted = encrypt_cbc(&KEY, &data).unwrap();
        assert_eq!(&encrypted[..16], &CIPHER);
        assert_ne!(&encrypted[16..], &CIPHER);
        assert_eq!(decrypt_cbc(&KEY, &encrypted).unwrap(), data);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        assert!(encrypt_ecb(&KEY, &[0u8; 15]).is_err());
        assert!(decrypt_cbc(&KEY, &[0u8; 17]).is_err());
    }
}
