//! Snapshot files: the full object state at one commit timestamp.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::debug;

use crate::durability::encoder::{self, Decoder};
use crate::error::{Result, StorageError};
use crate::property::PropertyValue;
use crate::types::{AdjacencyEntry, EdgeTypeId, Gid};

const SNAPSHOT_MAGIC: &[u8; 8] = b"LMNSNAP\0";
const SNAPSHOT_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotVertex {
    pub gid: Gid,
    pub labels: Vec<u64>,
    pub properties: Vec<(u64, PropertyValue)>,
    pub in_edges: Vec<AdjacencyEntry>,
    pub out_edges: Vec<AdjacencyEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEdge {
    pub gid: Gid,
    pub edge_type: u64,
    pub from: Gid,
    pub to: Gid,
    pub properties: Vec<(u64, PropertyValue)>,
}

/// Everything a snapshot file carries.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotData {
    pub uuid: String,
    pub epoch_id: String,
    pub start_timestamp: u64,
    pub names: Vec<(u64, String)>,
    pub vertices: Vec<SnapshotVertex>,
    pub edges: Vec<SnapshotEdge>,
}

fn write_adjacency(out: &mut Vec<u8>, entries: &[AdjacencyEntry]) {
    encoder::write_varint(out, entries.len() as u64);
    for entry in entries {
        encoder::write_u64(out, entry.edge_type.0);
        encoder::write_u64(out, entry.peer.as_u64());
        encoder::write_u64(out, entry.edge.as_u64());
    }
}

fn read_adjacency(decoder: &mut Decoder<'_>) -> Result<Vec<AdjacencyEntry>> {
    let count = decoder.read_varint()? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        entries.push(AdjacencyEntry::new(
            EdgeTypeId(decoder.read_u64()?),
            Gid::from_u64(decoder.read_u64()?),
            Gid::from_u64(decoder.read_u64()?),
        ));
    }
    Ok(entries)
}

fn write_properties(out: &mut Vec<u8>, properties: &[(u64, PropertyValue)]) {
    encoder::write_varint(out, properties.len() as u64);
    for (key, value) in properties {
        encoder::write_u64(out, *key);
        encoder::write_property_value(out, value);
    }
}

fn read_properties(decoder: &mut Decoder<'_>) -> Result<Vec<(u64, PropertyValue)>> {
    let count = decoder.read_varint()? as usize;
    let mut properties = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = decoder.read_u64()?;
        properties.push((key, decoder.read_property_value()?));
    }
    Ok(properties)
}

pub fn encode_snapshot(data: &SnapshotData) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    encoder::write_u64(&mut out, SNAPSHOT_VERSION);
    encoder::write_string(&mut out, &data.uuid);
    encoder::write_string(&mut out, &data.epoch_id);
    encoder::write_u64(&mut out, data.start_timestamp);

    encoder::write_varint(&mut out, data.names.len() as u64);
    for (id, name) in &data.names {
        encoder::write_u64(&mut out, *id);
        encoder::write_string(&mut out, name);
    }

    encoder::write_varint(&mut out, data.vertices.len() as u64);
    for vertex in &data.vertices {
        encoder::write_u64(&mut out, vertex.gid.as_u64());
        encoder::write_varint(&mut out, vertex.labels.len() as u64);
        for label in &vertex.labels {
            encoder::write_u64(&mut out, *label);
        }
        write_properties(&mut out, &vertex.properties);
        write_adjacency(&mut out, &vertex.in_edges);
        write_adjacency(&mut out, &vertex.out_edges);
    }

    encoder::write_varint(&mut out, data.edges.len() as u64);
    for edge in &data.edges {
        encoder::write_u64(&mut out, edge.gid.as_u64());
        encoder::write_u64(&mut out, edge.edge_type);
        encoder::write_u64(&mut out, edge.from.as_u64());
        encoder::write_u64(&mut out, edge.to.as_u64());
        write_properties(&mut out, &edge.properties);
    }

    let mut hasher = Hasher::new();
    hasher.update(&out);
    let checksum = hasher.finalize();
    out.extend_from_slice(&checksum.to_be_bytes());
    out
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<SnapshotData> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 4 {
        return Err(StorageError::Corruption("snapshot truncated".into()));
    }
    let (body, footer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_be_bytes(footer.try_into().expect("4 bytes"));
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(StorageError::Corruption(
            "snapshot footer checksum mismatch".into(),
        ));
    }
    if &body[..8] != SNAPSHOT_MAGIC {
        return Err(StorageError::Corruption("bad snapshot magic".into()));
    }

    let mut decoder = Decoder::new(&body[8..]);
    let version = decoder.read_u64()?;
    if version != SNAPSHOT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let uuid = decoder.read_string()?;
    let epoch_id = decoder.read_string()?;
    let start_timestamp = decoder.read_u64()?;

    let name_count = decoder.read_varint()? as usize;
    let mut names = Vec::with_capacity(name_count.min(1024));
    for _ in 0..name_count {
        let id = decoder.read_u64()?;
        names.push((id, decoder.read_string()?));
    }

    let vertex_count = decoder.read_varint()? as usize;
    let mut vertices = Vec::with_capacity(vertex_count.min(65536));
    for _ in 0..vertex_count {
        let gid = Gid::from_u64(decoder.read_u64()?);
        let label_count = decoder.read_varint()? as usize;
        let mut labels = Vec::with_capacity(label_count.min(1024));
        for _ in 0..label_count {
            labels.push(decoder.read_u64()?);
        }
        let properties = read_properties(&mut decoder)?;
        let in_edges = read_adjacency(&mut decoder)?;
        let out_edges = read_adjacency(&mut decoder)?;
        vertices.push(SnapshotVertex {
            gid,
            labels,
            properties,
            in_edges,
            out_edges,
        });
    }

    let edge_count = decoder.read_varint()? as usize;
    let mut edges = Vec::with_capacity(edge_count.min(65536));
    for _ in 0..edge_count {
        edges.push(SnapshotEdge {
            gid: Gid::from_u64(decoder.read_u64()?),
            edge_type: decoder.read_u64()?,
            from: Gid::from_u64(decoder.read_u64()?),
            to: Gid::from_u64(decoder.read_u64()?),
            properties: read_properties(&mut decoder)?,
        });
    }

    if decoder.remaining() != 0 {
        return Err(StorageError::Corruption(
            "snapshot has trailing bytes".into(),
        ));
    }

    Ok(SnapshotData {
        uuid,
        epoch_id,
        start_timestamp,
        names,
        vertices,
        edges,
    })
}

pub fn write_snapshot(directory: &Path, data: &SnapshotData) -> Result<PathBuf> {
    fs::create_dir_all(directory)?;
    let path = directory.join(format!("{}_{}.snapshot", data.uuid, data.start_timestamp));
    let bytes = encode_snapshot(data);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    debug!(
        start_timestamp = data.start_timestamp,
        vertices = data.vertices.len(),
        edges = data.edges.len(),
        path = %path.display(),
        "wrote snapshot"
    );
    Ok(path)
}

pub fn load_snapshot(path: &Path) -> Result<SnapshotData> {
    let bytes = fs::read(path)?;
    decode_snapshot(&bytes)
        .map_err(|err| StorageError::Recovery(format!("{}: {err}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFileInfo {
    pub path: PathBuf,
    pub uuid: String,
    pub start_timestamp: u64,
}

/// Snapshots in `directory`, sorted by start timestamp. `uuid = None`
/// lists every line of history (used at boot before the uuid is known).
pub fn list_snapshot_files(
    directory: &Path,
    uuid: Option<&str>,
) -> Result<Vec<SnapshotFileInfo>> {
    let mut infos = Vec::new();
    if !directory.exists() {
        return Ok(infos);
    }
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".snapshot") else {
            continue;
        };
        let Some((file_uuid, timestamp)) = stem.rsplit_once('_') else {
            continue;
        };
        let Ok(start_timestamp) = timestamp.parse() else {
            continue;
        };
        if uuid.is_some_and(|uuid| uuid != file_uuid) {
            continue;
        }
        let file_uuid = file_uuid.to_owned();
        infos.push(SnapshotFileInfo {
            path,
            uuid: file_uuid,
            start_timestamp,
        });
    }
    infos.sort_by_key(|info| info.start_timestamp);
    Ok(infos)
}
