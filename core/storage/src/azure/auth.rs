//! Shared Key request signing and service SAS generation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use stowage_common::{Error, Result};

use crate::sigv4::uri_encode;

type HmacSha256 = Hmac<Sha256>;

/// Storage service version sent with every request and signed into SAS
/// tokens.
pub const API_VERSION: &str = "2021-08-06";

/// Standard headers in the order the string to sign lists them.
const SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Storage account name and access key.
#[derive(Clone)]
pub struct SharedKey {
    account: String,
    key: Vec<u8>,
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SharedKey {
    /// Create a key from the base64 access key shown in the portal.
    ///
    /// # Errors
    /// - `InvalidInput` if the key is not valid base64
    pub fn new(account: impl Into<String>, access_key: &str) -> Result<Self> {
        let key = STANDARD
            .decode(access_key.trim())
            .map_err(|e| Error::InvalidInput(format!("Azure access key is not base64: {}", e)))?;
        Ok(Self {
            account: account.into(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn hmac_base64(&self, data: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("Invalid Azure access key: {}", e)))?;
        mac.update(data.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `Authorization` header value for a request.
    ///
    /// `headers` must hold every header that will be sent, with lowercase
    /// names, including `x-ms-date` and `x-ms-version`.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<String> {
        let signature = self.hmac_base64(&self.string_to_sign(method, url, headers))?;
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    pub(crate) fn string_to_sign(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
    ) -> String {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
                .unwrap_or_default()
        };

        let mut lines = vec![method.to_string()];
        for name in SIGNED_HEADERS {
            let value = lookup(name);
            // A zero length is signed as empty since version 2015-02-21.
            if name == "content-length" && value == "0" {
                lines.push(String::new());
            } else {
                lines.push(value.to_string());
            }
        }

        let ms_headers: BTreeMap<String, &str> = headers
            .iter()
            .filter(|(n, _)| n.to_ascii_lowercase().starts_with("x-ms-"))
            .map(|(n, v)| (n.to_ascii_lowercase(), v.trim()))
            .collect();
        let mut result = lines.join("\n");
        result.push('\n');
        for (name, value) in ms_headers {
            result.push_str(&format!("{}:{}\n", name, value));
        }
        result.push_str(&self.canonical_resource(url));
        result
    }

    fn canonical_resource(&self, url: &Url) -> String {
        let mut resource = format!("/{}{}", self.account, url.path());
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            resource.push_str(&format!("\n{}:{}", name, values.join(",")));
        }
        resource
    }

    /// Query string of a read-only service SAS for one blob.
    ///
    /// `blob` is the unencoded blob name.
    pub fn blob_read_sas(
        &self,
        container: &str,
        blob: &str,
        expiry: DateTime<Utc>,
    ) -> Result<String> {
        let expiry = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resource = format!("/blob/{}/{}/{}", self.account, container, blob);
        let fields: [&str; 16] = [
            "r", // permissions
            "",  // start
            &expiry,
            &resource,
            "", // identifier
            "", // IP range
            "https",
            API_VERSION,
            "b", // resource type: blob
            "",  // snapshot time
            "",  // encryption scope
            "",  // response header overrides: rscc, rscd, rsce, rscl, rsct
            "",
            "",
            "",
            "",
        ];
        let signature = self.hmac_base64(&fields.join("\n"))?;
        Ok(format!(
            "sv={}&spr=https&se={}&sr=b&sp=r&sig={}",
            API_VERSION,
            uri_encode(&expiry),
            uri_encode(&signature)
        ))
    }
}
