//! Self-contained export archive for one area description.
//!
//! Layout (all integers little-endian):
//! - magic `ATAF`
//! - u16 format version
//! - u16 uuid length, uuid bytes
//! - u32 metadata length, metadata as JSON object
//! - u64 payload length, payload bytes
//! - SHA-256 over everything above

use crate::error::ArchiveError;
use crate::types::AdfRecord;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"ATAF";
pub const VERSION: u16 = 1;
pub const EXTENSION: &str = "adf";
const CHECKSUM_LEN: usize = 32;

pub fn encode(record: &AdfRecord) -> Result<Vec<u8>, ArchiveError> {
    let metadata =
        serde_json::to_vec(&record.metadata).map_err(|e| ArchiveError::Metadata(e.to_string()))?;
    let uuid = record.uuid.as_bytes();
    let uuid_len = u16::try_from(uuid.len()).map_err(|_| ArchiveError::Metadata("uuid too long".into()))?;
    let meta_len =
        u32::try_from(metadata.len()).map_err(|_| ArchiveError::Metadata("metadata too large".into()))?;

    let mut out = Vec::with_capacity(
        4 + 2 + 2 + uuid.len() + 4 + metadata.len() + 8 + record.payload.len() + CHECKSUM_LEN,
    );
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&uuid_len.to_le_bytes());
    out.extend_from_slice(uuid);
    out.extend_from_slice(&meta_len.to_le_bytes());
    out.extend_from_slice(&metadata);
    out.extend_from_slice(&(record.payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&record.payload);

    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<AdfRecord, ArchiveError> {
    if bytes.len() < 4 {
        return Err(ArchiveError::Truncated);
    }
    if bytes[0..4] != MAGIC {
        return Err(ArchiveError::BadMagic);
    }
    if bytes.len() < 6 + CHECKSUM_LEN {
        return Err(ArchiveError::Truncated);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(ArchiveError::UnsupportedVersion(version));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(ArchiveError::ChecksumMismatch);
    }

    let mut reader = Reader { buf: body, pos: 6 };
    let uuid_len = u16::from_le_bytes(reader.array()?) as usize;
    let uuid = std::str::from_utf8(reader.take(uuid_len)?)
        .map_err(|e| ArchiveError::Metadata(format!("uuid: {}", e)))?
        .to_string();
    let meta_len = u32::from_le_bytes(reader.array()?) as usize;
    let metadata: BTreeMap<String, String> = serde_json::from_slice(reader.take(meta_len)?)
        .map_err(|e| ArchiveError::Metadata(e.to_string()))?;
    let payload_len = usize::try_from(u64::from_le_bytes(reader.array()?))
        .map_err(|_| ArchiveError::Truncated)?;
    let payload = reader.take(payload_len)?.to_vec();
    if reader.pos != body.len() {
        return Err(ArchiveError::Metadata("trailing bytes before checksum".into()));
    }

    Ok(AdfRecord {
        uuid,
        metadata,
        payload,
    })
}

/// Write `<dest_dir>/<uuid>.adf` via a temp file and rename.
pub fn write_file(record: &AdfRecord, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let bytes = encode(record)?;
    fs::create_dir_all(dest_dir).map_err(|source| ArchiveError::Io {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    let path = dest_dir.join(format!("{}.{}", record.uuid, EXTENSION));
    let tmp = dest_dir.join(format!(".{}.{}.tmp", record.uuid, EXTENSION));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    };
    if let Err(source) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(ArchiveError::Io { path, source });
    }
    Ok(path)
}

pub fn read_file(path: &Path) -> Result<AdfRecord, ArchiveError> {
    let bytes = fs::read(path).map_err(|source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiveError> {
        let end = self.pos.checked_add(n).ok_or(ArchiveError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(ArchiveError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ArchiveError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AdfStore, KEY_NAME};
    use tempfile::TempDir;

    fn record() -> AdfRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert(KEY_NAME.to_string(), "Kitchen".to_string());
        AdfRecord {
            uuid: "6f1c2a52-7a0e-4c4b-9a8e-0d3f1b2c4d5e".into(),
            metadata,
            payload: (0..=255u8).cycle().take(1000).collect(),
        }
    }

    #[test]
    fn test_decode_returns_exact_record() {
        let r = record();
        let bytes = encode(&r).unwrap();
        assert_eq!(&bytes[0..4], b"ATAF");
        assert_eq!(decode(&bytes).unwrap(), r);
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut bytes = encode(&record()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(decode(&bytes), Err(ArchiveError::ChecksumMismatch)));
    }

    #[test]
    fn test_rejects_foreign_and_short_input() {
        assert!(matches!(decode(b"AT"), Err(ArchiveError::Truncated)));
        assert!(matches!(decode(b"ZZZZ\x01\x00"), Err(ArchiveError::BadMagic)));
        let mut bytes = encode(&record()).unwrap();
        bytes[4] = 7;
        assert!(matches!(decode(&bytes), Err(ArchiveError::UnsupportedVersion(7))));
        let bytes = encode(&record()).unwrap();
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_export_import_between_stores() {
        let temp = TempDir::new().unwrap();
        let a = AdfStore::open(temp.path().join("a")).unwrap();
        let b = AdfStore::open(temp.path().join("b")).unwrap();

        let saved = a.persist(b"map bytes").unwrap();
        a.set_metadata(&saved.uuid, KEY_NAME, "Hall").unwrap();
        let path = a.export(&saved.uuid, &temp.path().join("out")).unwrap();

        let imported = b.import(&path).unwrap();
        assert_eq!(imported.uuid, saved.uuid);
        assert_eq!(imported.payload, b"map bytes");
        assert_eq!(b.get_metadata(&saved.uuid, KEY_NAME).as_deref(), Some("Hall"));

        // Importing again cannot reuse the uuid.
        let again = b.import(&path).unwrap();
        assert_ne!(again.uuid, saved.uuid);
        assert_eq!(b.list_all().len(), 2);
    }
}
