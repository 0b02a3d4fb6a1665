//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` so they land on the wire as
//! maps keyed by field name. Parameter objects are maps already and encode the
//! same either way.
//!
//! # Example
//!
//! ```
//! use rfcwire::codec::MsgPackCodec;
//! use rfcwire::transport::RfcObject;
//!
//! let mut params = RfcObject::new();
//! params.insert("REQUTEXT".into(), "hello".into());
//!
//! let encoded = MsgPackCodec::encode(&params).unwrap();
//! let decoded: RfcObject = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, params);
//! ```

use std::time::{Duration, Instant};

use crate::error::Result;

/// MessagePack codec for parameter and result objects.
pub struct MsgPackCodec;

/// An encoded payload and what encoding it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measured<T> {
    pub value: T,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode `value`, recording the payload size and encode time.
    pub fn encode_measured<T: serde::Serialize>(value: &T) -> Result<Measured<Vec<u8>>> {
        let started = Instant::now();
        let encoded = Self::encode(value)?;
        Ok(Measured {
            bytes: encoded.len() as u64,
            elapsed: started.elapsed(),
            value: encoded,
        })
    }

    /// Decode `bytes`, recording the decode time.
    pub fn decode_measured<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<Measured<T>> {
        let started = Instant::now();
        let value = Self::decode(bytes)?;
        Ok(Measured {
            bytes: bytes.len() as u64,
            elapsed: started.elapsed(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RfcError;
    use crate::transport::RfcObject;
    use serde_json::json;

    fn object(value: serde_json::Value) -> RfcObject {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_nested_parameter_object() {
        let params = object(json!({
            "IMPORTSTRUCT": {"RFCFLOAT": 1.5, "RFCCHAR4": "ABCD", "RFCINT4": -7},
            "RFCTABLE": [{"RFCINT1": 1}, {"RFCINT1": 2}],
            "EMPTY": null
        }));

        let encoded = MsgPackCodec::encode(&params).unwrap();
        let decoded: RfcObject = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_measured_sizes_agree() {
        let params = object(json!({"REQUTEXT": "hello"}));

        let encoded = MsgPackCodec::encode_measured(&params).unwrap();
        assert_eq!(encoded.bytes, encoded.value.len() as u64);

        let decoded: Measured<RfcObject> = MsgPackCodec::decode_measured(&encoded.value).unwrap();
        assert_eq!(decoded.bytes, encoded.bytes);
        assert_eq!(decoded.value, params);
    }

    #[test]
    fn test_larger_object_costs_more_bytes() {
        let small = MsgPackCodec::encode(&object(json!({"A": 1}))).unwrap();
        let large = MsgPackCodec::encode(&object(json!({"A": 1, "B": "x".repeat(100)}))).unwrap();
        assert!(large.len() > small.len());
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<RfcObject> = MsgPackCodec::decode(&[0xc1]);
        assert!(matches!(result, Err(RfcError::MsgPackDecode(_))));
    }

    #[test]
    fn test_decode_empty() {
        let result: Result<RfcObject> = MsgPackCodec::decode(&[]);
        assert!(result.is_err());
    }
}
