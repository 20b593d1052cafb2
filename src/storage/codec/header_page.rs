use crate::buffer::PAGE_SIZE;
use crate::error::{CrabTreeError, CrabTreeResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::HeaderPage;

pub struct HeaderPageCodec;

impl HeaderPageCodec {
    pub fn encode(page: &HeaderPage) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(page.records.len() as u32);
        for (name, root_page_id) in page.records.iter() {
            bytes.extend(CommonCodec::encode_bytes(name.as_bytes()));
            bytes.extend(CommonCodec::encode_u32(*root_page_id));
        }
        assert!(
            bytes.len() <= PAGE_SIZE,
            "header page image overflows a page"
        );
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> CrabTreeResult<DecodedData<HeaderPage>> {
        let mut left = bytes;

        let (record_count, offset) = CommonCodec::decode_u32(left)?;
        left = &left[offset..];

        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let (name_bytes, offset) = CommonCodec::decode_bytes(left)?;
            left = &left[offset..];
            let name = String::from_utf8(name_bytes).map_err(|e| {
                CrabTreeError::Internal(format!("header record name is not utf-8: {}", e))
            })?;
            let (root_page_id, offset) = CommonCodec::decode_u32(left)?;
            left = &left[offset..];
            records.push((name, root_page_id));
        }

        Ok((HeaderPage { records }, bytes.len() - left.len()))
    }
}
