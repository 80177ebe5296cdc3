//! Write-ahead log segments.
//!
//! The segment receiving appends is named `<uuid>_<seq>_current.wal`;
//! finalization rewrites the header's timestamp range and renames it to
//! `<uuid>_<seq>_<from>_<to>.wal`, so a directory listing alone tells
//! which commits a finalized segment covers.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::debug;

use crate::durability::encoder::{self, Decoder, WalDeltaOp, WalDeltaRecord};
use crate::error::{Result, StorageError};

const WAL_MAGIC: &[u8; 8] = b"LMNWAL\0\0";
const WAL_VERSION: u64 = 1;
/// Hyphenated v4 uuid, always 36 bytes, so the header stays fixed-size
/// and the timestamp range can be rewritten in place.
const UUID_LEN: usize = 36;
/// magic + version + uuid + seq + from + to
pub const WAL_HEADER_SIZE: usize = 8 + 8 + UUID_LEN + 8 + 8 + 8;

const FRAME_PREFIX_SIZE: usize = 4;
const FRAME_CRC_SIZE: usize = 4;

#[derive(Debug)]
pub struct WalFile {
    path: PathBuf,
    file: File,
    uuid: String,
    seq_num: u64,
    from_timestamp: Option<u64>,
    to_timestamp: u64,
    /// Frames appended but not yet written to the file. Shipped alongside
    /// the file bytes when the current WAL is transferred to a replica.
    buffer: Vec<u8>,
}

impl WalFile {
    pub fn create(wal_directory: &Path, uuid: &str, seq_num: u64) -> Result<Self> {
        if uuid.len() != UUID_LEN {
            return Err(StorageError::InvalidArgument(format!(
                "storage uuid must be {UUID_LEN} bytes, got {}",
                uuid.len()
            )));
        }
        fs::create_dir_all(wal_directory)?;
        let path = wal_directory.join(format!("{uuid}_{seq_num}_current.wal"));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = Vec::with_capacity(WAL_HEADER_SIZE);
        header.extend_from_slice(WAL_MAGIC);
        encoder::write_u64(&mut header, WAL_VERSION);
        header.extend_from_slice(uuid.as_bytes());
        encoder::write_u64(&mut header, seq_num);
        encoder::write_u64(&mut header, 0);
        encoder::write_u64(&mut header, 0);
        file.write_all(&header)?;
        file.sync_data()?;

        debug!(seq_num, path = %path.display(), "opened new wal segment");
        Ok(Self {
            path,
            file,
            uuid: uuid.to_owned(),
            seq_num,
            from_timestamp: None,
            to_timestamp: 0,
            buffer: Vec::new(),
        })
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn from_timestamp(&self) -> Option<u64> {
        self.from_timestamp
    }

    pub fn to_timestamp(&self) -> u64 {
        self.to_timestamp
    }

    /// Frames not yet written to the file.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes already flushed to the file, header included.
    pub fn file_bytes(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    /// Flushed plus buffered size, used by the rotation policy.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() + self.buffer.len() as u64)
    }

    pub fn append_transaction(&mut self, commit_timestamp: u64, ops: &[WalDeltaOp]) {
        let mut payload = Vec::new();
        encoder::encode_transaction(&mut payload, commit_timestamp, ops);

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        self.buffer
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(&payload);
        self.buffer.extend_from_slice(&checksum.to_be_bytes());

        self.from_timestamp.get_or_insert(commit_timestamp);
        self.to_timestamp = commit_timestamp;
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.buffer)?;
        self.file.sync_data()?;
        self.buffer.clear();
        Ok(())
    }

    /// Flushes, stamps the header with the final timestamp range and
    /// renames the segment to its terminal form. Returns the new path, or
    /// `None` when the segment never received a record and was removed.
    pub fn finalize(mut self) -> Result<Option<PathBuf>> {
        self.flush()?;
        let Some(from_timestamp) = self.from_timestamp else {
            fs::remove_file(&self.path)?;
            return Ok(None);
        };

        let range_offset = (8 + 8 + UUID_LEN + 8) as u64;
        self.file.seek(SeekFrom::Start(range_offset))?;
        let mut range = Vec::with_capacity(16);
        encoder::write_u64(&mut range, from_timestamp);
        encoder::write_u64(&mut range, self.to_timestamp);
        self.file.write_all(&range)?;
        self.file.sync_data()?;

        let final_path = self.path.with_file_name(format!(
            "{}_{}_{}_{}.wal",
            self.uuid, self.seq_num, from_timestamp, self.to_timestamp
        ));
        fs::rename(&self.path, &final_path)?;
        debug!(
            seq_num = self.seq_num,
            from_timestamp,
            to_timestamp = self.to_timestamp,
            path = %final_path.display(),
            "finalized wal segment"
        );
        Ok(Some(final_path))
    }
}

/// Metadata recovered from a finalized segment's file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileInfo {
    pub path: PathBuf,
    pub uuid: String,
    pub seq_num: u64,
    pub from_timestamp: u64,
    pub to_timestamp: u64,
}

/// Finalized segments of `uuid` in `directory`, sorted by sequence
/// number. Current segments and other epochs' files are skipped.
pub fn list_finalized_wal_files(directory: &Path, uuid: &str) -> Result<Vec<WalFileInfo>> {
    let mut infos = Vec::new();
    if !directory.exists() {
        return Ok(infos);
    }
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(info) = parse_wal_file_name(name, &path) {
            if info.uuid == uuid {
                infos.push(info);
            }
        }
    }
    infos.sort_by_key(|info| info.seq_num);
    Ok(infos)
}

fn parse_wal_file_name(name: &str, path: &Path) -> Option<WalFileInfo> {
    let stem = name.strip_suffix(".wal")?;
    let uuid = stem.get(..UUID_LEN)?;
    let rest = stem.get(UUID_LEN..)?.strip_prefix('_')?;
    let mut parts = rest.split('_');
    let seq_num = parts.next()?.parse().ok()?;
    let from_timestamp = parts.next()?.parse().ok()?;
    let to_timestamp = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(WalFileInfo {
        path: path.to_owned(),
        uuid: uuid.to_owned(),
        seq_num,
        from_timestamp,
        to_timestamp,
    })
}

/// Decoded contents of a segment.
#[derive(Debug)]
pub struct WalContents {
    pub uuid: String,
    pub seq_num: u64,
    pub transactions: Vec<(u64, Vec<WalDeltaOp>)>,
}

pub fn load_wal(path: &Path) -> Result<WalContents> {
    let bytes = fs::read(path)?;
    parse_wal_bytes(&bytes)
        .map_err(|err| StorageError::Recovery(format!("{}: {err}", path.display())))
}

/// Parses a full segment image, which is also what a replica receives for
/// a current-WAL transfer (file bytes plus the primary's append buffer).
pub fn parse_wal_bytes(bytes: &[u8]) -> Result<WalContents> {
    if bytes.len() < WAL_HEADER_SIZE {
        return Err(StorageError::Corruption("wal header truncated".into()));
    }
    if &bytes[..8] != WAL_MAGIC {
        return Err(StorageError::Corruption("bad wal magic".into()));
    }
    let mut decoder = Decoder::new(&bytes[8..WAL_HEADER_SIZE]);
    let version = decoder.read_u64()?;
    if version != WAL_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported wal version {version}"
        )));
    }
    let uuid = String::from_utf8(bytes[16..16 + UUID_LEN].to_vec())
        .map_err(|_| StorageError::Corruption("invalid uuid in wal header".into()))?;
    let mut decoder = Decoder::new(&bytes[16 + UUID_LEN..WAL_HEADER_SIZE]);
    let seq_num = decoder.read_u64()?;
    // The header's from/to range is only authoritative after finalize;
    // record timestamps below carry the truth either way.
    let _ = decoder.read_u64()?;
    let _ = decoder.read_u64()?;

    let mut records: Vec<WalDeltaRecord> = Vec::new();
    let mut pos = WAL_HEADER_SIZE;
    while pos < bytes.len() {
        if bytes.len() - pos < FRAME_PREFIX_SIZE {
            return Err(StorageError::Corruption("wal frame prefix truncated".into()));
        }
        let len =
            u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += FRAME_PREFIX_SIZE;
        if bytes.len() - pos < len + FRAME_CRC_SIZE {
            return Err(StorageError::Corruption("wal frame truncated".into()));
        }
        let payload = &bytes[pos..pos + len];
        pos += len;
        let stored_crc = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
        pos += FRAME_CRC_SIZE;

        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(StorageError::Corruption("wal frame checksum mismatch".into()));
        }

        let mut payload_decoder = Decoder::new(payload);
        while payload_decoder.remaining() > 0 {
            records.push(payload_decoder.read_delta_record()?);
        }
    }

    let transactions = encoder::group_transactions(records)?;
    Ok(WalContents {
        uuid,
        seq_num,
        transactions,
    })
}
