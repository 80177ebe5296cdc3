//! Byte-level codec shared by the WAL and the replication stream.
//!
//! Layout rules: lengths are LEB128 varints, timestamps and ids are
//! big-endian u64, every delta starts with a one-byte action code. Names
//! travel as text so a replica with a different name mapper can re-intern
//! them. Primary and replica must produce identical bytes for identical
//! state, so nothing in here may depend on map iteration order or
//! platform endianness.

use std::collections::BTreeMap;

use crate::error::{Result, StorageError};
use crate::property::{PropertyValue, TemporalType, TemporalValue};
use crate::types::Gid;

// Action codes on the wire and in WAL payloads.
const OP_CREATE_VERTEX: u8 = 0x01;
const OP_DELETE_VERTEX: u8 = 0x02;
const OP_ADD_LABEL: u8 = 0x03;
const OP_REMOVE_LABEL: u8 = 0x04;
const OP_SET_VERTEX_PROPERTY: u8 = 0x05;
const OP_CREATE_EDGE: u8 = 0x06;
const OP_DELETE_EDGE: u8 = 0x07;
const OP_SET_EDGE_PROPERTY: u8 = 0x08;
const OP_TRANSACTION_END: u8 = 0x0f;

// Property value tags.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;
const TAG_TEMPORAL: u8 = 7;

/// Forward operation of one committed mutation, with names resolved to
/// text. The unit shipped through the WAL and to replicas.
#[derive(Debug, Clone, PartialEq)]
pub enum WalDeltaOp {
    CreateVertex {
        gid: Gid,
    },
    DeleteVertex {
        gid: Gid,
    },
    AddLabel {
        gid: Gid,
        label: String,
    },
    RemoveLabel {
        gid: Gid,
        label: String,
    },
    SetVertexProperty {
        gid: Gid,
        key: String,
        value: PropertyValue,
    },
    CreateEdge {
        gid: Gid,
        edge_type: String,
        from: Gid,
        to: Gid,
    },
    DeleteEdge {
        gid: Gid,
        edge_type: String,
        from: Gid,
        to: Gid,
    },
    SetEdgeProperty {
        gid: Gid,
        key: String,
        value: PropertyValue,
    },
    /// Terminates every committed transaction in the stream.
    TransactionEnd,
}

/// One WAL / replication stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalDeltaRecord {
    pub commit_timestamp: u64,
    pub op: WalDeltaOp,
}

pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

pub fn write_property_value(out: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => write_u8(out, TAG_NULL),
        PropertyValue::Bool(value) => {
            write_u8(out, TAG_BOOL);
            write_u8(out, u8::from(*value));
        }
        PropertyValue::Int(value) => {
            write_u8(out, TAG_INT);
            write_u64(out, *value as u64);
        }
        PropertyValue::Double(value) => {
            write_u8(out, TAG_DOUBLE);
            write_u64(out, value.to_bits());
        }
        PropertyValue::String(value) => {
            write_u8(out, TAG_STRING);
            write_string(out, value);
        }
        PropertyValue::List(values) => {
            write_u8(out, TAG_LIST);
            write_varint(out, values.len() as u64);
            for value in values {
                write_property_value(out, value);
            }
        }
        PropertyValue::Map(values) => {
            write_u8(out, TAG_MAP);
            write_varint(out, values.len() as u64);
            for (key, value) in values {
                write_string(out, key);
                write_property_value(out, value);
            }
        }
        PropertyValue::Temporal(value) => {
            write_u8(out, TAG_TEMPORAL);
            write_u8(out, temporal_type_code(value.temporal_type));
            write_u64(out, value.microseconds as u64);
        }
    }
}

fn temporal_type_code(temporal_type: TemporalType) -> u8 {
    match temporal_type {
        TemporalType::Date => 0,
        TemporalType::LocalTime => 1,
        TemporalType::LocalDateTime => 2,
        TemporalType::Duration => 3,
    }
}

fn temporal_type_from_code(code: u8) -> Result<TemporalType> {
    match code {
        0 => Ok(TemporalType::Date),
        1 => Ok(TemporalType::LocalTime),
        2 => Ok(TemporalType::LocalDateTime),
        3 => Ok(TemporalType::Duration),
        other => Err(StorageError::Corruption(format!(
            "unknown temporal type code {other}"
        ))),
    }
}

pub fn write_delta_record(out: &mut Vec<u8>, record: &WalDeltaRecord) {
    write_u64(out, record.commit_timestamp);
    match &record.op {
        WalDeltaOp::CreateVertex { gid } => {
            write_u8(out, OP_CREATE_VERTEX);
            write_u64(out, gid.as_u64());
        }
        WalDeltaOp::DeleteVertex { gid } => {
            write_u8(out, OP_DELETE_VERTEX);
            write_u64(out, gid.as_u64());
        }
        WalDeltaOp::AddLabel { gid, label } => {
            write_u8(out, OP_ADD_LABEL);
            write_u64(out, gid.as_u64());
            write_string(out, label);
        }
        WalDeltaOp::RemoveLabel { gid, label } => {
            write_u8(out, OP_REMOVE_LABEL);
            write_u64(out, gid.as_u64());
            write_string(out, label);
        }
        WalDeltaOp::SetVertexProperty { gid, key, value } => {
            write_u8(out, OP_SET_VERTEX_PROPERTY);
            write_u64(out, gid.as_u64());
            write_string(out, key);
            write_property_value(out, value);
        }
        WalDeltaOp::CreateEdge {
            gid,
            edge_type,
            from,
            to,
        } => {
            write_u8(out, OP_CREATE_EDGE);
            write_u64(out, gid.as_u64());
            write_string(out, edge_type);
            write_u64(out, from.as_u64());
            write_u64(out, to.as_u64());
        }
        WalDeltaOp::DeleteEdge {
            gid,
            edge_type,
            from,
            to,
        } => {
            write_u8(out, OP_DELETE_EDGE);
            write_u64(out, gid.as_u64());
            write_string(out, edge_type);
            write_u64(out, from.as_u64());
            write_u64(out, to.as_u64());
        }
        WalDeltaOp::SetEdgeProperty { gid, key, value } => {
            write_u8(out, OP_SET_EDGE_PROPERTY);
            write_u64(out, gid.as_u64());
            write_string(out, key);
            write_property_value(out, value);
        }
        WalDeltaOp::TransactionEnd => {
            write_u8(out, OP_TRANSACTION_END);
        }
    }
}

/// Cursor over an encoded buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(StorageError::Corruption(
                "encoded buffer ended mid-record".into(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(StorageError::Corruption("varint overflows u64".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StorageError::Corruption("invalid utf8 in encoded string".into()))
    }

    pub fn read_property_value(&mut self) -> Result<PropertyValue> {
        match self.read_u8()? {
            TAG_NULL => Ok(PropertyValue::Null),
            TAG_BOOL => Ok(PropertyValue::Bool(self.read_u8()? != 0)),
            TAG_INT => Ok(PropertyValue::Int(self.read_u64()? as i64)),
            TAG_DOUBLE => Ok(PropertyValue::Double(f64::from_bits(self.read_u64()?))),
            TAG_STRING => Ok(PropertyValue::String(self.read_string()?)),
            TAG_LIST => {
                let len = self.read_varint()? as usize;
                let mut values = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    values.push(self.read_property_value()?);
                }
                Ok(PropertyValue::List(values))
            }
            TAG_MAP => {
                let len = self.read_varint()? as usize;
                let mut values = BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    values.insert(key, self.read_property_value()?);
                }
                Ok(PropertyValue::Map(values))
            }
            TAG_TEMPORAL => {
                let temporal_type = temporal_type_from_code(self.read_u8()?)?;
                let microseconds = self.read_u64()? as i64;
                Ok(PropertyValue::Temporal(TemporalValue::new(
                    temporal_type,
                    microseconds,
                )))
            }
            other => Err(StorageError::Corruption(format!(
                "unknown property value tag {other}"
            ))),
        }
    }

    pub fn read_delta_record(&mut self) -> Result<WalDeltaRecord> {
        let commit_timestamp = self.read_u64()?;
        let op = match self.read_u8()? {
            OP_CREATE_VERTEX => WalDeltaOp::CreateVertex {
                gid: Gid::from_u64(self.read_u64()?),
            },
            OP_DELETE_VERTEX => WalDeltaOp::DeleteVertex {
                gid: Gid::from_u64(self.read_u64()?),
            },
            OP_ADD_LABEL => WalDeltaOp::AddLabel {
                gid: Gid::from_u64(self.read_u64()?),
                label: self.read_string()?,
            },
            OP_REMOVE_LABEL => WalDeltaOp::RemoveLabel {
                gid: Gid::from_u64(self.read_u64()?),
                label: self.read_string()?,
            },
            OP_SET_VERTEX_PROPERTY => WalDeltaOp::SetVertexProperty {
                gid: Gid::from_u64(self.read_u64()?),
                key: self.read_string()?,
                value: self.read_property_value()?,
            },
            OP_CREATE_EDGE => WalDeltaOp::CreateEdge {
                gid: Gid::from_u64(self.read_u64()?),
                edge_type: self.read_string()?,
                from: Gid::from_u64(self.read_u64()?),
                to: Gid::from_u64(self.read_u64()?),
            },
            OP_DELETE_EDGE => WalDeltaOp::DeleteEdge {
                gid: Gid::from_u64(self.read_u64()?),
                edge_type: self.read_string()?,
                from: Gid::from_u64(self.read_u64()?),
                to: Gid::from_u64(self.read_u64()?),
            },
            OP_SET_EDGE_PROPERTY => WalDeltaOp::SetEdgeProperty {
                gid: Gid::from_u64(self.read_u64()?),
                key: self.read_string()?,
                value: self.read_property_value()?,
            },
            OP_TRANSACTION_END => WalDeltaOp::TransactionEnd,
            other => {
                return Err(StorageError::Corruption(format!(
                    "unknown delta action code {other:#04x}"
                )))
            }
        };
        Ok(WalDeltaRecord {
            commit_timestamp,
            op,
        })
    }
}

/// Encodes a whole committed transaction: every delta followed by the
/// `TransactionEnd` terminator, all stamped with `commit_timestamp`.
pub fn encode_transaction(out: &mut Vec<u8>, commit_timestamp: u64, ops: &[WalDeltaOp]) {
    for op in ops {
        write_delta_record(
            out,
            &WalDeltaRecord {
                commit_timestamp,
                op: op.clone(),
            },
        );
    }
    write_delta_record(
        out,
        &WalDeltaRecord {
            commit_timestamp,
            op: WalDeltaOp::TransactionEnd,
        },
    );
}

/// Splits a decoded record stream into complete transactions, each ending
/// at its `TransactionEnd` marker. A trailing partial transaction is an
/// error: the encoder always writes terminators last.
pub fn group_transactions(records: Vec<WalDeltaRecord>) -> Result<Vec<(u64, Vec<WalDeltaOp>)>> {
    let mut transactions = Vec::new();
    let mut current: Vec<WalDeltaOp> = Vec::new();
    let mut current_ts: Option<u64> = None;
    for record in records {
        match record.op {
            WalDeltaOp::TransactionEnd => {
                let ts = current_ts.unwrap_or(record.commit_timestamp);
                transactions.push((ts, std::mem::take(&mut current)));
                current_ts = None;
            }
            op => {
                if let Some(ts) = current_ts {
                    if ts != record.commit_timestamp {
                        return Err(StorageError::Corruption(
                            "commit timestamp changed mid-transaction".into(),
                        ));
                    }
                } else {
                    current_ts = Some(record.commit_timestamp);
                }
                current.push(op);
            }
        }
    }
    if current_ts.is_some() {
        return Err(StorageError::Corruption(
            "delta stream ended without TransactionEnd".into(),
        ));
    }
    Ok(transactions)
}
