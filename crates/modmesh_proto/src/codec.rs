//! Payload codecs keyed by a declared type tag.
//!
//! Every value that crosses the wire travels as an [`EncodedValue`]: the tag
//! names the codec, the bytes are whatever that codec produced. The registry
//! is a fixed dispatch table; tags it does not know fail with
//! [`MeshError::UnsupportedType`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::mesh_error::MeshError;

pub const TAG_RAW_BYTES: &str = "raw-bytes";
pub const TAG_STRUCTURED_RECORD: &str = "structured-record";
pub const TAG_TABULAR: &str = "tabular";
pub const TAG_TENSOR: &str = "tensor";

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Record(serde_json::Value),
    Table(Table),
    Tensor(Tensor),
}

impl Payload {
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => TAG_RAW_BYTES,
            Payload::Record(_) => TAG_STRUCTURED_RECORD,
            Payload::Table(_) => TAG_TABULAR,
            Payload::Tensor(_) => TAG_TENSOR,
        }
    }

    pub fn null() -> Self {
        Payload::Record(serde_json::Value::Null)
    }

    pub fn record<T: Serialize>(value: &T) -> Result<Self, MeshError> {
        Ok(Payload::Record(serde_json::to_value(value)?))
    }

    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Record(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Deserializes a structured record into `T`.
    pub fn parse_record<T: DeserializeOwned>(&self) -> Result<T, MeshError> {
        match self {
            Payload::Record(value) => Ok(serde_json::from_value(value.clone())?),
            other => Err(MeshError::Decode {
                reason: format!("expected {} payload, got {}", TAG_STRUCTURED_RECORD, other.tag()),
            }),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Record(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Table> for Payload {
    fn from(table: Table) -> Self {
        Payload::Table(table)
    }
}

impl From<Tensor> for Payload {
    fn from(tensor: Tensor) -> Self {
        Payload::Tensor(tensor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub tag: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnValues {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Bool(Vec<bool>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int64(values) => values.len(),
            ColumnValues::Float64(values) => values.len(),
            ColumnValues::Utf8(values) => values.len(),
            ColumnValues::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

/// Column-oriented table; every column has the same number of rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, MeshError> {
        let table = Self { columns };
        table.validate()?;
        Ok(table)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValues> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.values)
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |column| column.values.len())
    }

    fn validate(&self) -> Result<(), MeshError> {
        let rows = self.num_rows();
        let mut seen = BTreeMap::new();
        for column in &self.columns {
            if column.values.len() != rows {
                return Err(MeshError::Decode {
                    reason: format!(
                        "table column {} has {} rows, expected {}",
                        column.name,
                        column.values.len(),
                        rows
                    ),
                });
            }
            if seen.insert(column.name.as_str(), ()).is_some() {
                return Err(MeshError::Decode {
                    reason: format!("table column {} is duplicated", column.name),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    Uint8,
}

impl DType {
    fn width(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Float32(_) => DType::Float32,
            TensorData::Float64(_) => DType::Float64,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Uint8(_) => DType::Uint8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(values) => values.len(),
            TensorData::Float64(values) => values.len(),
            TensorData::Int32(values) => values.len(),
            TensorData::Int64(values) => values.len(),
            TensorData::Uint8(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Float32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Float64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Uint8(values) => values.clone(),
        }
    }

    fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self, MeshError> {
        let width = dtype.width();
        if bytes.len() % width != 0 {
            return Err(MeshError::Decode {
                reason: format!(
                    "tensor buffer of {} bytes is not a multiple of {:?} width {}",
                    bytes.len(),
                    dtype,
                    width
                ),
            });
        }
        let data = match dtype {
            DType::Uint8 => TensorData::Uint8(bytes.to_vec()),
            DType::Float32 => TensorData::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Int32 => TensorData::Int32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Float64 => TensorData::Float64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(le8(c)))
                    .collect(),
            ),
            DType::Int64 => TensorData::Int64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(le8(c)))
                    .collect(),
            ),
        };
        Ok(data)
    }
}

fn le8(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(chunk);
    out
}

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, MeshError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(MeshError::Decode {
                reason: format!(
                    "tensor shape {:?} needs {} elements, got {}",
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

/// Product of `shape`, or `Decode` when it does not fit in `usize`.
fn element_count(shape: &[usize]) -> Result<usize, MeshError> {
    shape.iter().try_fold(1usize, |acc, dim| {
        acc.checked_mul(*dim).ok_or_else(|| MeshError::Decode {
            reason: format!("tensor shape {:?} overflows the element count", shape),
        })
    })
}

pub trait Codec: Send + Sync {
    fn tag(&self) -> &'static str;
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, MeshError>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload, MeshError>;
}

fn mismatched(codec: &'static str, payload: &Payload) -> MeshError {
    MeshError::UnsupportedType {
        tag: format!("{} payload given to {} codec", payload.tag(), codec),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesCodec;

impl Codec for RawBytesCodec {
    fn tag(&self) -> &'static str {
        TAG_RAW_BYTES
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, MeshError> {
        match payload {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(mismatched(TAG_RAW_BYTES, other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, MeshError> {
        Ok(Payload::Bytes(bytes.to_vec()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl Codec for RecordCodec {
    fn tag(&self) -> &'static str {
        TAG_STRUCTURED_RECORD
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, MeshError> {
        match payload {
            Payload::Record(value) => Ok(serde_json::to_vec(value)?),
            other => Err(mismatched(TAG_STRUCTURED_RECORD, other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, MeshError> {
        Ok(Payload::Record(serde_json::from_slice(bytes)?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableCodec;

impl Codec for TableCodec {
    fn tag(&self) -> &'static str {
        TAG_TABULAR
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, MeshError> {
        match payload {
            Payload::Table(table) => Ok(serde_cbor::to_vec(table)?),
            other => Err(mismatched(TAG_TABULAR, other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, MeshError> {
        let table: Table = serde_cbor::from_slice(bytes)?;
        table.validate()?;
        Ok(Payload::Table(table))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TensorHeader {
    dtype: DType,
    wire_dtype: DType,
    shape: Vec<u64>,
}

/// Tensor frame: `[4B header length BE][CBOR header][little-endian data]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorCodec {
    int64_as_float64: bool,
}

impl TensorCodec {
    /// Carries int64 tensors as float64 on the wire and restores them on
    /// decode. Values outside ±2^53 lose precision under this flag.
    pub fn with_int64_as_float64() -> Self {
        Self {
            int64_as_float64: true,
        }
    }

    fn wire_data(&self, data: &TensorData) -> TensorData {
        match data {
            TensorData::Int64(values) if self.int64_as_float64 => {
                TensorData::Float64(values.iter().map(|v| *v as f64).collect())
            }
            other => other.clone(),
        }
    }
}

impl Codec for TensorCodec {
    fn tag(&self) -> &'static str {
        TAG_TENSOR
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, MeshError> {
        let Payload::Tensor(tensor) = payload else {
            return Err(mismatched(TAG_TENSOR, payload));
        };
        let wire = self.wire_data(&tensor.data);
        let header = TensorHeader {
            dtype: tensor.dtype(),
            wire_dtype: wire.dtype(),
            shape: tensor
                .shape
                .iter()
                .map(|dim| {
                    u64::try_from(*dim).map_err(|_| MeshError::Decode {
                        reason: format!("tensor dimension {} does not fit in u64", dim),
                    })
                })
                .collect::<Result<_, _>>()?,
        };
        let header_bytes = serde_cbor::to_vec(&header)?;
        let header_len = u32::try_from(header_bytes.len()).map_err(|_| MeshError::Decode {
            reason: "tensor header too large".to_string(),
        })?;
        let body = wire.to_le_bytes();
        let mut out = Vec::with_capacity(4 + header_bytes.len() + body.len());
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, MeshError> {
        if bytes.len() < 4 {
            return Err(MeshError::Decode {
                reason: "tensor frame shorter than its length prefix".to_string(),
            });
        }
        let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let header_len = usize::try_from(prefix).map_err(|_| MeshError::Decode {
            reason: "tensor header length does not fit in usize".to_string(),
        })?;
        let rest = &bytes[4..];
        if rest.len() < header_len {
            return Err(MeshError::Decode {
                reason: format!(
                    "tensor header needs {} bytes, frame has {}",
                    header_len,
                    rest.len()
                ),
            });
        }
        let header: TensorHeader = serde_cbor::from_slice(&rest[..header_len])?;
        let shape = header
            .shape
            .iter()
            .map(|dim| {
                usize::try_from(*dim).map_err(|_| MeshError::Decode {
                    reason: format!("tensor dimension {} does not fit in usize", dim),
                })
            })
            .collect::<Result<Vec<usize>, _>>()?;
        let expected = element_count(&shape)?;
        let data_len = rest.len() - header_len;
        if expected.checked_mul(header.wire_dtype.width()) != Some(data_len) {
            return Err(MeshError::Decode {
                reason: format!(
                    "tensor shape {:?} of {:?} does not match {} data bytes",
                    shape, header.wire_dtype, data_len
                ),
            });
        }
        let wire = TensorData::from_le_bytes(header.wire_dtype, &rest[header_len..])?;
        let data = match (header.dtype, wire) {
            (DType::Int64, TensorData::Float64(values)) => {
                TensorData::Int64(values.into_iter().map(|v| v as i64).collect())
            }
            (dtype, wire) if dtype == wire.dtype() => wire,
            (dtype, wire) => {
                return Err(MeshError::Decode {
                    reason: format!(
                        "tensor dtype {:?} cannot be restored from wire dtype {:?}",
                        dtype,
                        wire.dtype()
                    ),
                })
            }
        };
        Ok(Payload::Tensor(Tensor::new(shape, data)?))
    }
}

#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RawBytesCodec));
        registry.register(Arc::new(RecordCodec));
        registry.register(Arc::new(TableCodec));
        registry.register(Arc::new(TensorCodec::default()));
        registry
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("CodecRegistry").field("tags", &tags).finish()
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Installs `codec` for its tag, replacing any codec already there.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.tag().to_string(), codec);
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.codecs.keys().cloned().collect();
        tags.sort();
        tags
    }

    fn codec(&self, tag: &str) -> Result<&Arc<dyn Codec>, MeshError> {
        self.codecs
            .get(tag)
            .ok_or_else(|| MeshError::UnsupportedType {
                tag: tag.to_string(),
            })
    }

    pub fn encode(&self, payload: &Payload) -> Result<EncodedValue, MeshError> {
        let tag = payload.tag();
        let data = self.codec(tag)?.encode(payload)?;
        Ok(EncodedValue {
            tag: tag.to_string(),
            data,
        })
    }

    pub fn decode(&self, value: &EncodedValue) -> Result<Payload, MeshError> {
        self.decode_bytes(&value.tag, &value.data)
    }

    pub fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Result<Payload, MeshError> {
        self.codec(tag)?.decode(bytes)
    }

    pub fn encode_args(&self, args: &[Payload]) -> Result<Vec<EncodedValue>, MeshError> {
        args.iter().map(|arg| self.encode(arg)).collect()
    }

    pub fn decode_args(&self, args: &[EncodedValue]) -> Result<Vec<Payload>, MeshError> {
        args.iter().map(|arg| self.decode(arg)).collect()
    }

    pub fn encode_kwargs(
        &self,
        kwargs: &BTreeMap<String, Payload>,
    ) -> Result<BTreeMap<String, EncodedValue>, MeshError> {
        kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.encode(value)?)))
            .collect()
    }

    pub fn decode_kwargs(
        &self,
        kwargs: &BTreeMap<String, EncodedValue>,
    ) -> Result<BTreeMap<String, Payload>, MeshError> {
        kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.decode(value)?)))
            .collect()
    }
}
