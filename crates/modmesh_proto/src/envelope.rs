//! Signed request/response envelopes for the single `invoke` verb.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecRegistry, EncodedValue, Payload};
use crate::identity::{verify_signature, Identity};
use crate::mesh_error::{ErrorResponse, MeshError};
use crate::util::to_canonical_cbor;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub version: u8,
    pub function: String,
    pub args: Vec<EncodedValue>,
    pub kwargs: BTreeMap<String, EncodedValue>,
    pub timestamp_ms: i64,
    pub caller_address: String,
    pub public_key_hex: String,
    pub signature_hex: String,
}

#[derive(Debug, Serialize)]
struct CallSigningPayload<'a> {
    version: u8,
    function: &'a str,
    args: &'a [EncodedValue],
    kwargs: &'a BTreeMap<String, EncodedValue>,
    timestamp_ms: i64,
    caller_address: &'a str,
    public_key_hex: &'a str,
}

impl CallEnvelope {
    /// Encodes the arguments and signs the result with `caller`.
    pub fn signed(
        caller: &Identity,
        codecs: &CodecRegistry,
        function: &str,
        args: &[Payload],
        kwargs: &BTreeMap<String, Payload>,
        timestamp_ms: i64,
    ) -> Result<Self, MeshError> {
        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            function: function.to_string(),
            args: codecs.encode_args(args)?,
            kwargs: codecs.encode_kwargs(kwargs)?,
            timestamp_ms,
            caller_address: caller.address().to_string(),
            public_key_hex: caller.public_key_hex().to_string(),
            signature_hex: String::new(),
        };
        envelope.signature_hex = caller.sign(&envelope.signing_bytes()?);
        Ok(envelope)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, MeshError> {
        to_canonical_cbor(&CallSigningPayload {
            version: self.version,
            function: &self.function,
            args: &self.args,
            kwargs: &self.kwargs,
            timestamp_ms: self.timestamp_ms,
            caller_address: &self.caller_address,
            public_key_hex: &self.public_key_hex,
        })
    }

    pub fn verify(&self) -> Result<(), MeshError> {
        verify_signature(
            &self.caller_address,
            &self.public_key_hex,
            &self.signature_hex,
            &self.signing_bytes()?,
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        to_canonical_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        serde_cbor::from_slice(bytes).map_err(|err| MeshError::Decode {
            reason: format!("malformed call envelope: {}", err),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Result(EncodedValue),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub version: u8,
    pub body: ResponseBody,
    pub timestamp_ms: i64,
    pub responder_address: String,
    pub public_key_hex: String,
    pub signature_hex: String,
}

#[derive(Debug, Serialize)]
struct ResponseSigningPayload<'a> {
    version: u8,
    body: &'a ResponseBody,
    timestamp_ms: i64,
    responder_address: &'a str,
    public_key_hex: &'a str,
}

impl CallResponse {
    pub fn signed(
        responder: &Identity,
        body: ResponseBody,
        timestamp_ms: i64,
    ) -> Result<Self, MeshError> {
        let mut response = Self {
            version: ENVELOPE_VERSION,
            body,
            timestamp_ms,
            responder_address: responder.address().to_string(),
            public_key_hex: responder.public_key_hex().to_string(),
            signature_hex: String::new(),
        };
        response.signature_hex = responder.sign(&response.signing_bytes()?);
        Ok(response)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, MeshError> {
        to_canonical_cbor(&ResponseSigningPayload {
            version: self.version,
            body: &self.body,
            timestamp_ms: self.timestamp_ms,
            responder_address: &self.responder_address,
            public_key_hex: &self.public_key_hex,
        })
    }

    pub fn verify(&self) -> Result<(), MeshError> {
        verify_signature(
            &self.responder_address,
            &self.public_key_hex,
            &self.signature_hex,
            &self.signing_bytes()?,
        )
    }

    /// Decodes the body into a payload or the typed remote error.
    pub fn into_result(self, codecs: &CodecRegistry) -> Result<Payload, MeshError> {
        match self.body {
            ResponseBody::Result(value) => codecs.decode(&value),
            ResponseBody::Error(error) => Err(MeshError::from_response(error)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        to_canonical_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        serde_cbor::from_slice(bytes).map_err(|err| MeshError::Decode {
            reason: format!("malformed call response: {}", err),
        })
    }
}
