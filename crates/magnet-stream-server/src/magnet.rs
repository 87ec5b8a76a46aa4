//! Magnet URI parsing.
//!
//! Extracts the stable content hash (`xt=urn:btih:<hash>`) used as the session key.

use std::fmt;

const BTIH_MARKER: &str = "xt=urn:btih:";

/// Normalized (lowercase) BitTorrent info hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(String);

impl InfoHash {
    /// Parse a bare hash (hex or base32 form), normalizing to lowercase.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A magnet URI together with the info hash extracted from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagnetLink {
    pub uri: String,
    pub info_hash: InfoHash,
}

impl MagnetLink {
    /// Parse a (possibly still percent-encoded) magnet URI.
    ///
    /// The `xt=urn:btih:` marker is matched case-insensitively; the hash runs until
    /// the next `&` or the end of the URI.
    pub fn parse(raw: &str) -> Option<Self> {
        let uri = decode_identifier(raw);
        let lower = uri.to_ascii_lowercase();
        let start = lower.find(BTIH_MARKER)? + BTIH_MARKER.len();
        let rest = &uri[start..];
        let end = rest.find('&').unwrap_or(rest.len());
        let info_hash = InfoHash::parse(&rest[..end])?;
        Some(Self { uri, info_hash })
    }
}

/// Resolve a stream identifier that is either a bare info hash or a magnet URI.
pub fn info_hash_from_identifier(raw: &str) -> Option<InfoHash> {
    let decoded = decode_identifier(raw);
    if let Some(link) = MagnetLink::parse(&decoded) {
        return Some(link.info_hash);
    }
    InfoHash::parse(&decoded)
}

/// Percent-decode an identifier, falling back to the raw input when it is not valid UTF-8.
pub fn decode_identifier(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";

    #[test]
    fn parses_plain_magnet() {
        let link = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{HASH}&dn=Sintel")).unwrap();
        assert_eq!(link.info_hash.as_str(), HASH);
        assert!(link.uri.starts_with("magnet:?"));
    }

    #[test]
    fn parses_percent_encoded_magnet() {
        let raw = format!("magnet%3A%3Fxt%3Durn%3Abtih%3A{HASH}%26dn%3DSintel");
        let link = MagnetLink::parse(&raw).unwrap();
        assert_eq!(link.info_hash.as_str(), HASH);
        assert_eq!(link.uri, format!("magnet:?xt=urn:btih:{HASH}&dn=Sintel"));
    }

    #[test]
    fn marker_is_case_insensitive_and_hash_is_lowercased() {
        let link = MagnetLink::parse("magnet:?XT=URN:BTIH:ABCDEF0123&tr=udp").unwrap();
        assert_eq!(link.info_hash.as_str(), "abcdef0123");
    }

    #[test]
    fn rejects_non_magnet_strings() {
        assert!(MagnetLink::parse("not-a-magnet").is_none());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:&dn=x").is_none());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:zz/..&dn=x").is_none());
    }

    #[test]
    fn identifier_accepts_hash_or_magnet() {
        let from_hash = info_hash_from_identifier(&HASH.to_ascii_uppercase()).unwrap();
        let from_magnet =
            info_hash_from_identifier(&format!("magnet:?xt=urn:btih:{HASH}")).unwrap();
        assert_eq!(from_hash, from_magnet);
        assert!(info_hash_from_identifier("../etc").is_none());
    }
}
