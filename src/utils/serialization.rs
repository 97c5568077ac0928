// One encoding for everything that is hashed, stored or sent: bincode's
// standard configuration with varint integers. Hashes of blocks and
// transactions depend on these exact bytes.
use crate::error::{BlockchainError, Result};
use bincode::config::{Configuration, Limit, LittleEndian, Varint};
use bincode::{Decode, Encode};

/// No single encoded value may claim more than this many bytes.
pub const MAX_DECODE_BYTES: usize = 32 * 1024 * 1024;

fn encoding() -> Configuration<LittleEndian, Varint, Limit<MAX_DECODE_BYTES>> {
    bincode::config::standard().with_limit::<MAX_DECODE_BYTES>()
}

pub fn serialize<T: Encode>(data: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(data, encoding())?)
}

/// Decodes exactly one value; bytes left over after it are an error.
pub fn deserialize<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (data, read) = bincode::decode_from_slice(bytes, encoding())?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "{} trailing bytes after decoded value",
            bytes.len() - read
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Outpoint {
        txid: Vec<u8>,
        index: i32,
        signature: Option<Vec<u8>>,
    }

    #[test]
    fn test_optional_and_negative_fields_survive() {
        let outpoints = vec![
            Outpoint {
                txid: vec![],
                index: -1,
                signature: None,
            },
            Outpoint {
                txid: vec![7; 32],
                index: 3,
                signature: Some(vec![9; 64]),
            },
        ];
        let bytes = serialize(&outpoints).unwrap();
        assert_eq!(deserialize::<Vec<Outpoint>>(&bytes).unwrap(), outpoints);
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = serialize(&7u32).unwrap();
        bytes.push(0);
        assert!(matches!(
            deserialize::<u32>(&bytes),
            Err(BlockchainError::Serialization(_))
        ));
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        // varint marker 0xFD followed by a u64 length far above the limit
        let mut bytes = vec![0xFD];
        bytes.extend(u64::MAX.to_le_bytes());
        assert!(deserialize::<Vec<u8>>(&bytes).is_err());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(deserialize::<Outpoint>(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
