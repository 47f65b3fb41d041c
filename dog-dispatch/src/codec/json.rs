use serde_json::Value;

use crate::{codec::JobCodec, DispatchError, DispatchResult};

/// JSON codec for job payloads
#[derive(Debug, Clone)]
pub struct JsonCodec;

impl JobCodec for JsonCodec {
    fn encode(&self, value: &Value) -> DispatchResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> DispatchResult<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| DispatchError::Validation(format!("Invalid JSON payload: {}", e)))
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_garbage_is_validation_error() {
        let codec = JsonCodec;
        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn test_codec_id() {
        let codec = JsonCodec;
        assert_eq!(codec.codec_id(), "json");
        assert_eq!(codec.decode(&codec.encode(&json!([1, 2])).unwrap()).unwrap(), json!([1, 2]));
    }
}
