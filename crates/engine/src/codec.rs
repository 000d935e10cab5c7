//! Entity codecs.
//!
//! Every payload passing between an entity and the record file goes through
//! the store's codec. The store is generic over it, so the choice is fixed
//! when the store is opened; a file must always be reopened with the codec
//! that wrote it.

use rackdb_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns entities into payload bytes and back.
///
/// # Thread Safety
///
/// Codecs are shared by every thread using the store.
pub trait EntityCodec: Send + Sync + 'static {
    /// Encode an entity.
    fn encode<T: Serialize>(&self, entity: &T) -> Result<Vec<u8>>;

    /// Decode an entity.
    ///
    /// Returns `Serialization` if the bytes do not describe a `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Unique codec identifier.
    fn codec_id(&self) -> &'static str;
}

/// MessagePack with named fields (the default).
///
/// Named fields keep payloads readable by entity types that add or reorder
/// optional fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackCodec;

impl EntityCodec for MessagePackCodec {
    fn encode<T: Serialize>(&self, entity: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(entity)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn codec_id(&self) -> &'static str {
        "msgpack"
    }
}

/// JSON text payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EntityCodec for JsonCodec {
    fn encode<T: Serialize>(&self, entity: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(entity)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}

/// Compact positional bincode payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl EntityCodec for BincodeCodec {
    fn encode<T: Serialize>(&self, entity: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(entity)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn codec_id(&self) -> &'static str {
        "bincode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackdb_core::Error;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: u32,
        customer: String,
        lines: Vec<f64>,
    }

    fn invoice() -> Invoice {
        Invoice {
            number: 7,
            customer: "acme".to_string(),
            lines: vec![1.5, 2.25],
        }
    }

    #[test]
    fn test_every_codec_decodes_what_it_encodes() {
        fn check<C: EntityCodec>(codec: C) {
            let bytes = codec.encode(&invoice()).unwrap();
            assert_eq!(codec.decode::<Invoice>(&bytes).unwrap(), invoice());
        }
        check(MessagePackCodec);
        check(JsonCodec);
        check(BincodeCodec);
    }

    #[test]
    fn test_msgpack_keeps_field_names() {
        let bytes = MessagePackCodec.encode(&invoice()).unwrap();
        assert!(bytes.windows(8).any(|w| w == b"customer"));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            JsonCodec.decode::<Invoice>(b"{not json"),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            MessagePackCodec.decode::<Invoice>(&[0xc1]),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_codec_ids_are_distinct() {
        let ids = [
            MessagePackCodec.codec_id(),
            JsonCodec.codec_id(),
            BincodeCodec.codec_id(),
        ];
        assert_eq!(ids, ["msgpack", "json", "bincode"]);
    }
}
