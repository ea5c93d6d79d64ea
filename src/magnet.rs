//! Magnet reference parsing.
//!
//! Callers send either a bare info hash or a full `magnet:?xt=urn:btih:...`
//! URI. Both normalize to a lowercase hash plus a canonical magnet link.

use crate::error::HeimdallError;

const BTIH_PREFIX: &str = "urn:btih:";
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub hash: String,
    pub link: String,
}

impl MagnetLink {
    pub fn parse(value: &str) -> Result<Self, HeimdallError> {
        let value = value.trim();

        if !value.starts_with("magnet:") {
            let hash = normalize_hash(value)?;
            return Ok(Self {
                link: format!("magnet:?xt={}{}", BTIH_PREFIX, hash),
                hash,
            });
        }

        let url = reqwest::Url::parse(value)
            .map_err(|e| HeimdallError::Parsing(format!("invalid magnet: {}", e)))?;

        let mut xt = None;
        let mut name = None;
        for (key, val) in url.query_pairs() {
            match key.as_ref() {
                "xt" if xt.is_none() => xt = Some(val.into_owned()),
                "dn" => name = Some(val.into_owned()),
                _ => {}
            }
        }

        let xt = xt.ok_or_else(|| HeimdallError::Parsing("magnet without xt".into()))?;
        let raw_hash = xt
            .strip_prefix(BTIH_PREFIX)
            .ok_or_else(|| HeimdallError::Parsing(format!("unsupported xt: {}", xt)))?;
        let hash = normalize_hash(raw_hash)?;

        let mut link = format!("magnet:?xt={}{}", BTIH_PREFIX, hash);
        if let Some(name) = &name {
            link.push_str("&dn=");
            link.push_str(&urlencoding::encode(name));
        }

        Ok(Self { hash, link })
    }
}

/// Lowercase a hex hash, convert base32 hashes to hex, and accept other
/// alphanumeric ids verbatim (some stores use native ids).
fn normalize_hash(raw: &str) -> Result<String, HeimdallError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(HeimdallError::Parsing(format!("invalid hash: {:?}", raw)));
    }

    if raw.len() == 32 && !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Some(bytes) = decode_base32(raw) {
            return Ok(hex::encode(bytes));
        }
    }

    Ok(raw.to_ascii_lowercase())
}

fn decode_base32(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in input.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "c9e15763f722f23e98a29decdfae341b98d53056";

    #[test]
    fn test_bare_hash_is_lowercased() {
        let magnet = MagnetLink::parse(&HASH.to_uppercase()).unwrap();
        assert_eq!(magnet.hash, HASH);
        assert_eq!(magnet.link, format!("magnet:?xt=urn:btih:{}", HASH));
    }

    #[test]
    fn test_magnet_uri() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Big%20Buck%20Bunny&tr=udp%3A%2F%2Ftracker.example%3A1337",
            HASH.to_uppercase()
        );
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.hash, HASH);
        assert!(magnet.link.ends_with("&dn=Big%20Buck%20Bunny"));
    }

    #[test]
    fn test_base32_hash_converted_to_hex() {
        let magnet = MagnetLink::parse("ZHQVOY7XELZD5GFCTXWN7LRUDOMNKMCW").unwrap();
        assert_eq!(magnet.hash, HASH);

        let uri = "magnet:?xt=urn:btih:zhqvoy7xelzd5gfctxwn7lrudomnkmcw";
        assert_eq!(MagnetLink::parse(uri).unwrap().hash, HASH);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(MagnetLink::parse("").is_err());
        assert!(MagnetLink::parse("not a hash").is_err());
        assert!(MagnetLink::parse("magnet:?dn=nothing").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:sha1:abc").is_err());
    }
}
