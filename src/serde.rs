//! # Serde support for Sketch
//!
//! A [`Sketch`] is serialized as the tuple `(key, expires_at, data)` where `data` is the
//! compact encoding produced by [`Sketch::to_bytes`]. Deserialization validates `data`
//! with the same rules as restore from a backend.
//!
//! The shard a sketch belongs to depends on the container it lives in, so a deserialized
//! sketch is owned by shard 0. Persistence bookkeeping (pending mutations, deletion state)
//! is not part of the serialized form.
use serde::de::Error;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize};

use crate::sketch::Sketch;

impl Serialize for Sketch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(self.key())?;
        tup.serialize_element(&self.expires_at())?;
        tup.serialize_element(&self.to_bytes())?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Sketch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (key, expires_at, data): (String, u64, Vec<u8>) =
            Deserialize::deserialize(deserializer)?;
        Sketch::from_bytes(key, 0, expires_at, &data).map_err(Error::custom)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::hash::{HashFunction, Murmur3};
    use test_case::test_case;

    #[test_case(0; "empty sketch")]
    #[test_case(1; "single value")]
    #[test_case(50; "sparse sketch")]
    #[test_case(10000; "dense sketch")]
    fn test_serde(n: usize) {
        let original = Sketch::new("visitors", 3, 1_700_000_000);
        for i in 0..n {
            original.add_hash(Murmur3.hash32(format!("item{}", i).as_bytes()));
        }

        let serialized = serde_json::to_string(&original).expect("serialization failed");
        let deserialized: Sketch =
            serde_json::from_str(&serialized).expect("deserialization failed");

        assert_eq!(original, deserialized);
        assert_eq!(deserialized.expires_at(), 1_700_000_000);
        assert_eq!(deserialized.shard(), 0);
        assert_eq!(original.estimate(), deserialized.estimate());
    }

    #[test_case(r#"["k",0,[]]"#; "empty data")]
    #[test_case(r#"["k",0,[1,7]]"#; "truncated sparse data")]
    #[test_case(r#"["k",0,[1,7,26]]"#; "rank out of range")]
    #[test_case(r#"["k",0]"#; "missing data")]
    #[test_case("{ invalid_json_string }"; "invalid json")]
    fn test_failed_deserialization(input: &str) {
        let result: Result<Sketch, _> = serde_json::from_str(input);
        assert!(result.is_err());
    }
}
