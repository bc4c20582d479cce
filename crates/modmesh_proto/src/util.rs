use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::mesh_error::MeshError;

/// Self-describing CBOR with map keys in canonical order, so signatures are
/// stable across struct layout and map iteration order.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    let mut buf = Vec::with_capacity(256);
    let canonical_value = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)?;
    Ok(buf)
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis_to_i64_saturating)
        .unwrap_or(0)
}

pub fn duration_millis_to_i64_saturating(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
