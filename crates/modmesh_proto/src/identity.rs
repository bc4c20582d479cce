use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::mesh_error::MeshError;

const ADDRESS_BYTES: usize = 20;
const IDENTITY_TABLE_KEY: &str = "identity";
const PRIVATE_KEY_FIELD: &str = "private_key";

/// A signing keypair plus the address derived from its public half.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    public_key_hex: String,
    address: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand_core::OsRng))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    pub fn from_secret_hex(private_key_hex: &str) -> Result<Self, MeshError> {
        let bytes = decode_hex_array::<32>(private_key_hex.trim(), "private key")
            .map_err(|reason| MeshError::InvalidConfig { reason })?;
        Ok(Self::from_seed(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            public_key_hex: hex::encode(public_key),
            address: address_from_public_key(&public_key),
            signing_key,
        }
    }

    /// Reads `[identity] private_key` from a TOML file, generating and
    /// writing a fresh key when the file or field is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, MeshError> {
        let storage_error = |reason: String| MeshError::Storage {
            key: path.display().to_string(),
            reason,
        };
        let mut table = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|err| storage_error(format!("read failed: {}", err)))?;
            if content.trim().is_empty() {
                toml::map::Map::new()
            } else {
                let value: toml::Value = toml::from_str(&content)
                    .map_err(|err| storage_error(format!("parse failed: {}", err)))?;
                value
                    .as_table()
                    .cloned()
                    .ok_or_else(|| storage_error("root must be a table".to_string()))?
            }
        } else {
            toml::map::Map::new()
        };

        let section = table
            .entry(IDENTITY_TABLE_KEY.to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()))
            .as_table_mut()
            .ok_or_else(|| storage_error("field 'identity' must be a table".to_string()))?;
        let existing = section
            .get(PRIVATE_KEY_FIELD)
            .and_then(toml::Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        if let Some(private_key_hex) = existing {
            return Self::from_secret_hex(&private_key_hex);
        }

        let identity = Self::generate();
        section.insert(
            PRIVATE_KEY_FIELD.to_string(),
            toml::Value::String(identity.secret_hex()),
        );
        let content = toml::to_string_pretty(&table)
            .map_err(|err| storage_error(format!("serialize failed: {}", err)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| storage_error(format!("create parent failed: {}", err)))?;
            }
        }
        fs::write(path, content).map_err(|err| storage_error(format!("write failed: {}", err)))?;
        Ok(identity)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(payload);
        hex::encode(signature.to_bytes())
    }
}

/// Lowercase hex of the first 20 bytes of `blake3(public_key)`.
pub fn address_from_public_key(public_key: &[u8; 32]) -> String {
    let digest = blake3::hash(public_key);
    hex::encode(&digest.as_bytes()[..ADDRESS_BYTES])
}

/// Checks that `public_key_hex` derives `address` and that `signature_hex`
/// signs `payload` under that key.
pub fn verify_signature(
    address: &str,
    public_key_hex: &str,
    signature_hex: &str,
    payload: &[u8],
) -> Result<(), MeshError> {
    let auth_error = |reason: String| MeshError::Authentication { reason };
    let public_key_bytes = decode_hex_array::<32>(public_key_hex, "public key").map_err(auth_error)?;
    let signature_bytes = decode_hex_array::<64>(signature_hex, "signature").map_err(auth_error)?;
    let derived = address_from_public_key(&public_key_bytes);
    if derived != address {
        return Err(auth_error(format!(
            "address {} does not match public key (derives {})",
            address, derived
        )));
    }
    let verifying_key = VerifyingKey::from_bytes(&public_key_bytes)
        .map_err(|err| auth_error(format!("parse public key failed: {err}")))?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify(payload, &signature)
        .map_err(|err| auth_error(format!("verify signature failed: {err}")))
}

fn decode_hex_array<const N: usize>(raw: &str, label: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(raw).map_err(|_| format!("{label} must be valid hex"))?;
    bytes
        .try_into()
        .map_err(|_| format!("{label} must be {N}-byte hex"))
}
