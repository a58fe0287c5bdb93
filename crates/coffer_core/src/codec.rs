//! The field crypto codec: transparent at-rest protection for the sensitive
//! field subset of each entity kind.
//!
//! Sensitive values are serialized to their string form, encrypted, and
//! replaced by an opaque `enc$<base64>` token. Decoding reverses this and
//! attempts structured re-parsing (numeric/JSON), falling back to the
//! decrypted string. Without an unlocked key both directions are pass-through:
//! callers tolerate degraded plaintext operation rather than fail hard.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};
use tracing::warn;

use crate::crypto::{CryptoManager, KeyProvider};
use crate::error::CoreResult;
use crate::record::{EntityKind, Record};

/// Prefix marking an encrypted field token.
pub const TOKEN_PREFIX: &str = "enc$";

/// An isolated per-field decode failure (corrupt token, wrong key).
///
/// One bad field must not hide an entire entity from the user, so decode
/// collects these instead of aborting; the affected field keeps its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecodeFailure {
    /// The field that failed to decode.
    pub field: String,
    /// Description of the failure.
    pub message: String,
}

/// Encrypts and decrypts the configured sensitive fields per entity kind.
pub struct FieldCodec {
    crypto: Option<CryptoManager>,
}

impl FieldCodec {
    /// Creates a codec from the session key provider.
    ///
    /// If the provider is not ready the codec operates in pass-through mode.
    pub fn from_provider(provider: &dyn KeyProvider) -> CoreResult<Self> {
        if !provider.is_ready() {
            return Ok(Self::passthrough());
        }
        Ok(Self {
            crypto: Some(CryptoManager::new(provider.derive_key()?)),
        })
    }

    /// Creates a codec with an unlocked key.
    pub fn with_key(key: crate::crypto::EncryptionKey) -> Self {
        Self {
            crypto: Some(CryptoManager::new(key)),
        }
    }

    /// Creates a pass-through codec for the key-less state.
    pub fn passthrough() -> Self {
        Self { crypto: None }
    }

    /// Returns true if the codec holds an unlocked key.
    pub fn is_active(&self) -> bool {
        self.crypto.is_some()
    }

    /// Returns a copy of `record` with its sensitive fields tokenized.
    ///
    /// The input is never mutated. Already-tokenized values are left alone,
    /// so encoding is idempotent.
    pub fn encode(&self, kind: EntityKind, record: &Record) -> CoreResult<Record> {
        let mut encoded = record.clone();
        encoded.fields = self.encode_fields(kind, &record.fields)?;
        Ok(encoded)
    }

    /// Tokenizes the sensitive fields present in `fields`.
    pub fn encode_fields(
        &self,
        kind: EntityKind,
        fields: &Map<String, Value>,
    ) -> CoreResult<Map<String, Value>> {
        let Some(crypto) = &self.crypto else {
            return Ok(fields.clone());
        };

        let mut out = fields.clone();
        for &name in kind.sensitive_fields() {
            let Some(value) = out.get(name) else { continue };
            if value.is_null() || is_token(value) {
                continue;
            }
            let plaintext = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let ciphertext = crypto.encrypt(plaintext.as_bytes())?;
            out.insert(
                name.to_string(),
                Value::String(format!("{TOKEN_PREFIX}{}", BASE64_STANDARD.encode(ciphertext))),
            );
        }
        Ok(out)
    }

    /// Returns a copy of `record` with its tokens decrypted, plus any
    /// isolated per-field failures.
    pub fn decode(
        &self,
        kind: EntityKind,
        record: &Record,
    ) -> (Record, Vec<FieldDecodeFailure>) {
        let (fields, failures) = self.decode_fields(kind, &record.fields);
        let mut decoded = record.clone();
        decoded.fields = fields;
        (decoded, failures)
    }

    /// Decrypts the tokens among the sensitive fields of `fields`.
    ///
    /// Values that are not tokens pass through untouched, so data written in
    /// a degraded (key-less) state stays readable once the key is unlocked.
    pub fn decode_fields(
        &self,
        kind: EntityKind,
        fields: &Map<String, Value>,
    ) -> (Map<String, Value>, Vec<FieldDecodeFailure>) {
        let mut out = fields.clone();
        let mut failures = Vec::new();

        let Some(crypto) = &self.crypto else {
            return (out, failures);
        };

        for &name in kind.sensitive_fields() {
            let Some(value) = out.get(name) else { continue };
            if !is_token(value) {
                continue;
            }
            // Unwrap is safe: is_token established a string with the prefix.
            let token = value.as_str().unwrap_or_default();
            match decode_token(crypto, token) {
                Ok(plain) => {
                    out.insert(name.to_string(), plain);
                }
                Err(message) => {
                    warn!(field = name, kind = %kind, "field decode failed: {message}");
                    failures.push(FieldDecodeFailure {
                        field: name.to_string(),
                        message,
                    });
                }
            }
        }
        (out, failures)
    }
}

/// Returns true if the value is an opaque ciphertext token.
fn is_token(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with(TOKEN_PREFIX))
}

fn decode_token(crypto: &CryptoManager, token: &str) -> Result<Value, String> {
    let raw = BASE64_STANDARD
        .decode(&token[TOKEN_PREFIX.len()..])
        .map_err(|e| format!("invalid token encoding: {e}"))?;
    let plaintext = crypto.decrypt(&raw).map_err(|e| e.to_string())?;
    let text = String::from_utf8(plaintext).map_err(|_| "plaintext is not UTF-8".to_string())?;

    // Numbers and structured values were serialized before encryption;
    // anything that does not parse back is an ordinary string.
    match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => Ok(parsed),
        Err(_) => Ok(Value::String(text)),
    }
}
