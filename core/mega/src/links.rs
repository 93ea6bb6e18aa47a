//! Public link format.
//!
//! `<base>/file/<handle>#<key>` or `<base>/folder/<handle>#<key>`, where the
//! key is unpadded base64url. The legacy `#!handle!key` and
//! `#F!handle!key` fragments are also accepted when parsing.

use url::Url;

use stowage_common::{Error, Result};
use stowage_crypto::{base64url_decode, base64url_encode};

/// Default host for generated links.
pub const DEFAULT_LINK_BASE: &str = "https://mega.nz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    File,
    Folder,
}

/// A parsed public link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicLink {
    pub kind: LinkKind,
    pub handle: String,
    pub key: Vec<u8>,
}

impl PublicLink {
    /// Render as a URL under `base`.
    pub fn to_url(&self, base: &str) -> String {
        let segment = match self.kind {
            LinkKind::File => "file",
            LinkKind::Folder => "folder",
        };
        format!(
            "{}/{}/{}#{}",
            base.trim_end_matches('/'),
            segment,
            self.handle,
            base64url_encode(&self.key)
        )
    }

    /// Parse a link in either the current or the legacy format.
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link)
            .map_err(|e| Error::InvalidInput(format!("Invalid link '{}': {}", link, e)))?;
        let fragment = url
            .fragment()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("Link '{}' carries no key", link)))?;

        if let Some(legacy) = fragment.strip_prefix('!') {
            return Self::from_parts(LinkKind::File, legacy.split_once('!'), link);
        }
        if let Some(legacy) = fragment.strip_prefix("F!") {
            return Self::from_parts(LinkKind::Folder, legacy.split_once('!'), link);
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let kind = match segments.as_slice() {
            ["file", _] => LinkKind::File,
            ["folder", _] => LinkKind::Folder,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Link '{}' is not a file or folder link",
                    link
                )))
            }
        };
        Self::from_parts(kind, Some((segments[1], fragment)), link)
    }

    fn from_parts(kind: LinkKind, parts: Option<(&str, &str)>, link: &str) -> Result<Self> {
        let (handle, key) = parts
            .filter(|(h, k)| !h.is_empty() && !k.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("Malformed link '{}'", link)))?;
        Ok(Self {
            kind,
            handle: handle.to_string(),
            key: base64url_decode(key)?,
        })
    }
}
