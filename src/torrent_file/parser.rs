// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use serde_bencode::de;
use serde_bencode::value::Value;

use crate::errors::MetainfoError;
use crate::torrent_file::{Metainfo, Torrent};

/// Parses a `.torrent` document into its outer fields plus validated metainfo.
pub fn from_bytes(bencode_data: &[u8]) -> Result<(Torrent, Metainfo), MetainfoError> {
    // Decode generically first so the info dict can be re-encoded on its own for hashing.
    let generic: Value = de::from_bytes(bencode_data)?;
    let info_value = match generic {
        Value::Dict(mut top_level) => top_level
            .remove("info".as_bytes())
            .ok_or_else(|| MetainfoError::InvalidLength("missing info dictionary".into()))?,
        _ => {
            return Err(MetainfoError::InvalidLength(
                "torrent file is not a dictionary".into(),
            ))
        }
    };
    let info_bytes = serde_bencode::to_bytes(&info_value)?;

    let torrent: Torrent = de::from_bytes(bencode_data)?;
    let metainfo = Metainfo::from_info_bytes(info_bytes)?;
    Ok((torrent, metainfo))
}

pub async fn from_file(path: &Path) -> Result<(Torrent, Metainfo), MetainfoError> {
    let data = tokio::fs::read(path).await?;
    from_bytes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::tests::single_file_info;
    use crate::torrent_file::{Info, InfoFile};
    use sha1::{Digest, Sha1};

    #[test]
    fn test_parse_single_file_torrent() {
        let info = single_file_info("movie.mkv", 16384, &[3u8; 50_000]);
        let torrent = Torrent {
            info: info.clone(),
            comment: Some("hello".into()),
            ..Default::default()
        };
        let bytes = serde_bencode::to_bytes(&torrent).unwrap();

        let (parsed, meta) = from_bytes(&bytes).unwrap();
        assert_eq!(parsed.comment.as_deref(), Some("hello"));
        assert_eq!(meta.info, info);
        assert_eq!(meta.num_pieces(), 4);

        let expected_hash: [u8; 20] = Sha1::digest(serde_bencode::to_bytes(&info).unwrap()).into();
        assert_eq!(meta.info_hash, expected_hash);
    }

    #[test]
    fn test_parse_multi_file_torrent() {
        let data = vec![9u8; 30_000];
        let mut info: Info = single_file_info("album", 16384, &data);
        info.length = 0;
        info.files = vec![
            InfoFile {
                length: 10_000,
                path: vec!["cd1".into(), "track1.flac".into()],
            },
            InfoFile {
                length: 20_000,
                path: vec!["track2.flac".into()],
            },
        ];
        let torrent = Torrent {
            info,
            ..Default::default()
        };
        let (_, meta) = from_bytes(&serde_bencode::to_bytes(&torrent).unwrap()).unwrap();
        assert!(meta.info.is_multi_file());
        assert_eq!(meta.total_length(), 30_000);
        assert_eq!(meta.info.file_list().len(), 2);
    }

    #[test]
    fn test_missing_info_dict_is_rejected() {
        let bytes = b"d7:comment5:helloe";
        assert!(from_bytes(bytes).is_err());
        assert!(from_bytes(b"i42e").is_err());
        assert!(from_bytes(b"not bencode").is_err());
    }
}
