//! # Serializers
//!
//! The store treats payloads as opaque bytes; a `Serializer` converts a
//! domain value to and from that byte form at the API boundary. The
//! store hands `deserialize` a slice covering exactly the stored record
//! and requires it to consume every byte; leftover bytes indicate a
//! serializer bug and fail the read.

use eyre::{ensure, Result};

pub trait Serializer<A> {
    /// Appends the serialized form of `value` to `out`.
    fn serialize(&self, out: &mut Vec<u8>, value: &A) -> Result<()>;

    /// Reconstructs a value from `input`, advancing the slice past every
    /// byte it consumes. On entry the slice covers exactly one record.
    fn deserialize(&self, input: &mut &[u8]) -> Result<A>;
}

/// Pass-through serializer for raw byte payloads.
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<Vec<u8>> {
        let ret = input.to_vec();
        *input = &[];
        Ok(ret)
    }
}

/// UTF-8 string serializer.
pub struct StrSerializer;

impl Serializer<String> for StrSerializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &String) -> Result<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<String> {
        let ret = std::str::from_utf8(input)
            .map_err(|e| eyre::eyre!("record is not valid UTF-8: {}", e))?
            .to_owned();
        *input = &[];
        Ok(ret)
    }
}

/// Fixed-width little-endian u64 serializer.
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn serialize(&self, out: &mut Vec<u8>, value: &u64) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<u64> {
        ensure!(input.len() >= 8, "record too short for u64: {}", input.len());
        let (head, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(head.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let mut out = Vec::new();
        BytesSerializer.serialize(&mut out, &vec![1, 2, 3]).unwrap();

        let mut input = out.as_slice();
        let back = BytesSerializer.deserialize(&mut input).unwrap();

        assert_eq!(back, vec![1, 2, 3]);
        assert!(input.is_empty());
    }

    #[test]
    fn str_roundtrip() {
        let mut out = Vec::new();
        StrSerializer.serialize(&mut out, &"héllo".to_string()).unwrap();

        let mut input = out.as_slice();
        assert_eq!(StrSerializer.deserialize(&mut input).unwrap(), "héllo");
    }

    #[test]
    fn str_rejects_invalid_utf8() {
        let mut input: &[u8] = &[0xFF, 0xFE];
        assert!(StrSerializer.deserialize(&mut input).is_err());
    }

    #[test]
    fn u64_leaves_trailing_bytes() {
        let mut out = Vec::new();
        U64Serializer.serialize(&mut out, &99).unwrap();
        out.push(0xAA);

        let mut input = out.as_slice();
        assert_eq!(U64Serializer.deserialize(&mut input).unwrap(), 99);
        assert_eq!(input, &[0xAA]);
    }
}
