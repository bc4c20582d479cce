//! Wire types shared by every mesh node: payload codecs, identities,
//! signed envelopes, the error taxonomy and blob storage.

pub mod blob_store;
pub mod codec;
pub mod envelope;
pub mod identity;
pub mod mesh_error;
pub mod util;

pub use blob_store::{get_json, put_json, BlobStore, FileBlobStore, InMemoryBlobStore};
pub use codec::{
    Codec, CodecRegistry, Column, ColumnValues, DType, EncodedValue, Payload, Table, Tensor,
    TensorData,
};
pub use envelope::{CallEnvelope, CallResponse, ResponseBody, ENVELOPE_VERSION};
pub use identity::{address_from_public_key, verify_signature, Identity};
pub use mesh_error::{ErrorCode, ErrorResponse, MeshError};
pub use util::now_unix_ms;
