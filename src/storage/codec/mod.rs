mod header_page;
mod index_page;

pub use header_page::HeaderPageCodec;
pub use index_page::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, BPlusTreePageTypeCodec,
};

use crate::error::{CrabTreeError, CrabTreeResult};
use crate::storage::page::RecordId;

// decoded value + consumed byte count
pub type DecodedData<T> = (T, usize);

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(value: u8) -> Vec<u8> {
        vec![value]
    }

    pub fn decode_u8(bytes: &[u8]) -> CrabTreeResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(CrabTreeError::Internal(
                "not enough bytes to decode u8".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(value: u32) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> CrabTreeResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(CrabTreeError::Internal(
                "not enough bytes to decode u32".to_string(),
            ));
        }
        let value = u32::from_be_bytes(bytes[0..4].try_into().map_err(|_| {
            CrabTreeError::Internal("u32 byte slice conversion failed".to_string())
        })?);
        Ok((value, 4))
    }

    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Self::encode_u32(data.len() as u32);
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> CrabTreeResult<DecodedData<Vec<u8>>> {
        let (len, offset) = Self::decode_u32(bytes)?;
        let len = len as usize;
        if bytes.len() < offset + len {
            return Err(CrabTreeError::Internal(
                "not enough bytes to decode byte string".to_string(),
            ));
        }
        Ok((bytes[offset..offset + len].to_vec(), offset + len))
    }
}

pub struct RidCodec;

impl RidCodec {
    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(rid.page_id);
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> CrabTreeResult<DecodedData<RecordId>> {
        let (page_id, offset) = CommonCodec::decode_u32(bytes)?;
        let (slot_num, offset2) = CommonCodec::decode_u32(&bytes[offset..])?;
        Ok((RecordId::new(page_id, slot_num), offset + offset2))
    }
}

/// Order-preserving key encoding for signed 64-bit integers: flipping the
/// sign bit makes the big-endian byte order match the numeric order.
pub struct IndexKeyCodec;

impl IndexKeyCodec {
    pub fn encode_i64(value: i64) -> Vec<u8> {
        ((value as u64) ^ (1u64 << 63)).to_be_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> CrabTreeResult<i64> {
        if bytes.len() != 8 {
            return Err(CrabTreeError::Internal(format!(
                "i64 key must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let raw = u64::from_be_bytes(bytes.try_into().map_err(|_| {
            CrabTreeError::Internal("i64 key byte slice conversion failed".to_string())
        })?);
        Ok((raw ^ (1u64 << 63)) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::IndexKeyCodec;

    #[test]
    fn test_i64_key_encoding_preserves_order() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| IndexKeyCodec::encode_i64(*v)).collect();
        for window in encoded.windows(2) {
            assert!(window[0] < window[1]);
        }
        for (value, bytes) in values.iter().zip(encoded.iter()) {
            assert_eq!(IndexKeyCodec::decode_i64(bytes).unwrap(), *value);
        }
    }
}
