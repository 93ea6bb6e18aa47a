//! Base64 variant used throughout the MEGA API.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use stowage_common::{Error, Result};

/// Encode as unpadded URL-safe base64.
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe base64, tolerating padding and the standard alphabet.
pub fn base64url_decode(data: &str) -> Result<Vec<u8>> {
    let normalized: String = data
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Crypto(format!("Invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_variants() {
        let bytes = [0xfb, 0xff, 0xfe];
        assert_eq!(base64url_encode(&bytes), "-__-");
        assert_eq!(base64url_decode("-__-").unwrap(), bytes);
        assert_eq!(base64url_decode("+//+").unwrap(), bytes);
        assert_eq!(base64url_decode("QQ==").unwrap(), b"A");
    }

    #[test]
    fn test_decode_invalid() {
        assert!(base64url_decode("!!").is_err());
    }
}
