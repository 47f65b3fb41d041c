pub mod json;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{codec::json::JsonCodec, DispatchError, DispatchResult};

/// Current envelope schema version; newer envelopes are rejected
pub const PAYLOAD_SCHEMA_VERSION: u16 = 1;

/// Opaque, schema-versioned payload envelope carried by jobs and requests
///
/// Handlers decode the shape they expect; a decode failure is a
/// [`DispatchError::Validation`], never a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Envelope schema version
    pub schema_version: u16,

    /// Codec used to produce `bytes`
    pub codec: String,

    /// Serialized payload bytes
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Encode any serializable value with the JSON codec
    pub fn json<T: Serialize + ?Sized>(value: &T) -> DispatchResult<Self> {
        Ok(Self {
            schema_version: PAYLOAD_SCHEMA_VERSION,
            codec: JsonCodec.codec_id().to_string(),
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Wrap an already-decoded JSON value
    pub fn from_value(value: &Value) -> DispatchResult<Self> {
        Self::json(value)
    }

    /// Wrap bytes produced by some codec
    pub fn raw(codec: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            schema_version: PAYLOAD_SCHEMA_VERSION,
            codec: codec.into(),
            bytes,
        }
    }

    /// Decode a JSON payload into the expected shape
    pub fn decode<T: DeserializeOwned>(&self) -> DispatchResult<T> {
        self.check_version()?;
        if self.codec != "json" {
            return Err(DispatchError::Validation(format!(
                "Payload codec '{}' cannot be decoded as JSON",
                self.codec
            )));
        }
        serde_json::from_slice(&self.bytes)
            .map_err(|e| DispatchError::Validation(format!("Invalid payload: {}", e)))
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn check_version(&self) -> DispatchResult<()> {
        if self.schema_version == 0 || self.schema_version > PAYLOAD_SCHEMA_VERSION {
            return Err(DispatchError::Validation(format!(
                "Unsupported payload schema version {} (max {})",
                self.schema_version, PAYLOAD_SCHEMA_VERSION
            )));
        }
        Ok(())
    }
}

/// Trait for payload codecs
pub trait JobCodec: Send + Sync {
    /// Encode a JSON value into bytes
    fn encode(&self, value: &Value) -> DispatchResult<Vec<u8>>;

    /// Decode bytes back into a JSON value
    fn decode(&self, bytes: &[u8]) -> DispatchResult<Value>;

    /// Get codec identifier
    fn codec_id(&self) -> &'static str;
}

/// Registry for managing different codecs
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn JobCodec>>,
    default_codec: String,
}

impl CodecRegistry {
    /// Create a new codec registry with JSON as default
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            default_codec: "json".to_string(),
        };
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Register a new codec
    pub fn register(&mut self, codec: Arc<dyn JobCodec>) {
        self.codecs.insert(codec.codec_id().to_string(), codec);
    }

    /// Get a codec by ID
    pub fn get_codec(&self, codec_id: &str) -> DispatchResult<Arc<dyn JobCodec>> {
        self.codecs
            .get(codec_id)
            .cloned()
            .ok_or_else(|| DispatchError::CodecNotFound(codec_id.to_string()))
    }

    /// Set the default codec
    pub fn set_default_codec(&mut self, codec_id: &str) -> DispatchResult<()> {
        if self.codecs.contains_key(codec_id) {
            self.default_codec = codec_id.to_string();
            Ok(())
        } else {
            Err(DispatchError::CodecNotFound(codec_id.to_string()))
        }
    }

    /// List available codecs
    pub fn available_codecs(&self) -> Vec<String> {
        let mut codecs: Vec<String> = self.codecs.keys().cloned().collect();
        codecs.sort();
        codecs
    }

    /// Encode a value with the default codec
    pub fn encode(&self, value: &Value) -> DispatchResult<Payload> {
        let codec = self.get_codec(&self.default_codec)?;
        Ok(Payload::raw(codec.codec_id(), codec.encode(value)?))
    }

    /// Decode an envelope with whichever codec produced it
    pub fn decode_value(&self, payload: &Payload) -> DispatchResult<Value> {
        payload.check_version()?;
        let codec = self.get_codec(&payload.codec)?;
        codec.decode(&payload.bytes)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_decode_rejects_wrong_shape() {
        let payload = Payload::json(&json!({"x": 1})).unwrap();
        let decoded: Value = payload.decode().unwrap();
        assert_eq!(decoded, json!({"x": 1}));

        let err = payload.decode::<Vec<u32>>().unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn test_newer_schema_version_rejected() {
        let mut payload = Payload::json(&json!(1)).unwrap();
        payload.schema_version = PAYLOAD_SCHEMA_VERSION + 1;

        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.decode_value(&payload),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_codec() {
        let registry = CodecRegistry::new();
        let payload = Payload::raw("msgpack", vec![0x90]);

        assert!(matches!(
            registry.decode_value(&payload),
            Err(DispatchError::CodecNotFound(id)) if id == "msgpack"
        ));
        assert!(registry.clone().set_default_codec("msgpack").is_err());
        assert_eq!(registry.available_codecs(), vec!["json"]);
    }
}
