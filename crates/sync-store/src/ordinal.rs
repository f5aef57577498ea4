use std::borrow::Cow;

use heed::{BoxedError, BytesDecode, BytesEncode};
use sync_types::{ConfigId, Ordinal};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, SyncStore};

const KEY_SIZE: usize = 16 + std::mem::size_of::<u64>();

#[derive(thiserror::Error, Debug)]
#[error("Could not decode an ordinal key: expected {KEY_SIZE} bytes but received {0} bytes")]
pub struct DecodeOrdinalKeyError(usize);

/// Key codec for the `(config_id, ordinal)` index: 16 raw uuid bytes followed
/// by the big-endian ordinal, so LMDB's key order is the per-config ordinal
/// order.
pub struct OrdinalKeyCodec;

impl<'a> BytesEncode<'a> for OrdinalKeyCodec {
    type EItem = (ConfigId, Ordinal);

    fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let (config_id, ordinal) = item;
        let mut ret = Vec::with_capacity(KEY_SIZE);
        ret.extend_from_slice(config_id.as_bytes());
        ret.extend_from_slice(&ordinal.to_be_bytes());
        Ok(Cow::Owned(ret))
    }
}

impl<'a> BytesDecode<'a> for OrdinalKeyCodec {
    type DItem = (ConfigId, Ordinal);

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, BoxedError> {
        if bytes.len() != KEY_SIZE {
            return Err(Box::new(DecodeOrdinalKeyError(bytes.len())));
        }
        let config_id = Uuid::from_slice(&bytes[..16]).map_err(Box::new)?;
        let ordinal = u64::from_be_bytes(bytes[16..].try_into().unwrap());
        Ok((config_id, ordinal))
    }
}

impl SyncStore {
    /// Return a microsecond timestamp strictly greater than any ordinal
    /// previously allocated for this config. On clock regression the value
    /// advances by one microsecond from the prior one instead.
    pub fn allocate_ordinal(&self, config_id: ConfigId) -> Result<Ordinal> {
        let mut wtxn = self.env.write_txn()?;
        let key = config_id.to_string();
        let last = self.last_ordinals.get(&wtxn, &key)?.unwrap_or(0);
        let now_micros = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as u64;
        let next = now_micros.max(last + 1);
        self.last_ordinals.put(&mut wtxn, &key, &next)?;
        wtxn.commit()?;
        Ok(next)
    }

    /// The highest ordinal ever allocated for this config, if any.
    pub fn last_allocated_ordinal(&self, config_id: ConfigId) -> Result<Option<Ordinal>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.last_ordinals.get(&rtxn, &config_id.to_string())?)
    }
}
