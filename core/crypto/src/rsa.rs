//! RSA session-id decryption.
//!
//! Accounts with an RSA key pair receive their session id encrypted to the
//! public key. The private key arrives AES-wrapped as four MPIs `p q d u`,
//! each prefixed by its length in bits as a big-endian `u16`.

use num_bigint::BigUint;

use crate::encoding::base64url_encode;
use stowage_common::{Error, Result};

/// Bytes of the decrypted value that form the session id.
pub const SESSION_ID_LENGTH: usize = 43;

/// Read one MPI, returning it and the remaining input.
pub fn read_mpi(data: &[u8]) -> Result<(BigUint, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Crypto("Truncated MPI header".to_string()));
    }
    let bits = u16::from_be_bytes([data[0], data[1]]) as usize;
    let len = bits.div_ceil(8);
    let rest = &data[2..];
    if rest.len() < len {
        return Err(Error::Crypto(format!(
            "Truncated MPI: need {} bytes, have {}",
            len,
            rest.len()
        )));
    }
    Ok((BigUint::from_bytes_be(&rest[..len]), &rest[len..]))
}

/// Private half of an account RSA key.
pub struct RsaPrivateKey {
    n: BigUint,
    d: BigUint,
}

impl RsaPrivateKey {
    /// Parse the unwrapped `privk` blob. Trailing padding is ignored.
    pub fn from_mpis(data: &[u8]) -> Result<Self> {
        let (p, rest) = read_mpi(data)?;
        let (q, rest) = read_mpi(rest)?;
        let (d, rest) = read_mpi(rest)?;
        // u = p^-1 mod q; only needed for CRT, which this client skips.
        let _ = read_mpi(rest)?;

        let n = &p * &q;
        if n == BigUint::from(0u32) || d == BigUint::from(0u32) {
            return Err(Error::Crypto("Degenerate RSA private key".to_string()));
        }
        Ok(Self { n, d })
    }

    /// Raw RSA decryption `c^d mod n`.
    pub fn decrypt(&self, ciphertext: &BigUint) -> BigUint {
        ciphertext.modpow(&self.d, &self.n)
    }
}

/// Recover the session id from the wrapped `privk` blob and `csid`.
pub fn decrypt_session_id(privk: &[u8], csid: &[u8]) -> Result<String> {
    let key = RsaPrivateKey::from_mpis(privk)?;
    let (ciphertext, _) = read_mpi(csid)?;
    let plain = key.decrypt(&ciphertext).to_bytes_be();
    let take = plain.len().min(SESSION_ID_LENGTH);
    Ok(base64url_encode(&plain[..take]))
}
