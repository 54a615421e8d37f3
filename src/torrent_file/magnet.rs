// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use data_encoding::BASE32;
use magnet_url::Magnet;

use crate::errors::MetainfoError;
use crate::torrent_file::InfoHash;

/// What a magnet link (or a bare info-hash) tells us before metadata is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetSpec {
    pub info_hash: InfoHash,
    pub name: Option<String>,
}

pub fn decode_info_hash(hash_string: &str) -> Result<InfoHash, MetainfoError> {
    let bytes = if hash_string.len() == 40 {
        hex::decode(hash_string).map_err(|e| MetainfoError::InvalidInfoHash(e.to_string()))?
    } else if hash_string.len() == 32 {
        BASE32
            .decode(hash_string.to_uppercase().as_bytes())
            .map_err(|e| MetainfoError::InvalidInfoHash(e.to_string()))?
    } else {
        return Err(MetainfoError::InvalidInfoHash(format!(
            "invalid length {}",
            hash_string.len()
        )));
    };
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| MetainfoError::InvalidInfoHash(format!("{} bytes", b.len())))
}

/// Accepts a `magnet:` URI or a bare hex/base32 info-hash. Control characters are dropped first.
pub fn parse(input: &str) -> Result<MagnetSpec, MetainfoError> {
    let cleaned: String = input.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if !cleaned.starts_with("magnet:") {
        return Ok(MagnetSpec {
            info_hash: decode_info_hash(cleaned)?,
            name: None,
        });
    }

    let magnet =
        Magnet::new(cleaned).map_err(|e| MetainfoError::InvalidMagnet(format!("{:?}", e)))?;
    match magnet.hash_type() {
        Some("btih") => {}
        other => {
            return Err(MetainfoError::InvalidMagnet(format!(
                "unsupported hash type {:?}",
                other
            )))
        }
    }
    let hash_string = magnet
        .hash()
        .ok_or_else(|| MetainfoError::InvalidMagnet("missing info hash".into()))?;
    let info_hash = decode_info_hash(hash_string)?;
    let name = magnet
        .display_name()
        .map(|n| n.replace('+', " "))
        .filter(|n| !n.is_empty());

    Ok(MagnetSpec { info_hash, name })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_bare_hex_hash() {
        let link = parse(HEX).unwrap();
        assert_eq!(hex::encode(link.info_hash), HEX);
        assert!(link.name.is_none());
    }

    #[test]
    fn test_parse_magnet_with_name() {
        let uri = format!("magnet:?xt=urn:btih:{}&dn=ubuntu", HEX);
        let link = parse(&uri).unwrap();
        assert_eq!(hex::encode(link.info_hash), HEX);
        assert_eq!(link.name.as_deref(), Some("ubuntu"));
    }

    #[test]
    fn test_control_characters_are_stripped() {
        let uri = format!("\u{7}magnet:?xt=urn:btih:{}\n", HEX);
        assert_eq!(hex::encode(parse(&uri).unwrap().info_hash), HEX);
    }

    #[test]
    fn test_base32_hash_matches_hex() {
        let raw = hex::decode(HEX).unwrap();
        let b32 = BASE32.encode(&raw).to_lowercase();
        assert_eq!(b32.len(), 32);
        assert_eq!(decode_info_hash(&b32).unwrap().to_vec(), raw);
    }

    #[test]
    fn test_invalid_hash_length_is_rejected() {
        assert!(matches!(
            parse("abcd"),
            Err(MetainfoError::InvalidInfoHash(_))
        ));
        assert!(parse("magnet:?xt=urn:btih:zz").is_err());
    }
}
