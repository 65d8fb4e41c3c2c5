//! Feedback blocks carried on append acknowledgements.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::lsn::Lsn;
use crate::messages::{WireError, take_bytes, take_i64, take_u8, take_u32};

/// Hot-standby feedback relayed from a read replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HotStandbyFeedback {
    pub ts: i64,
    pub xmin: u64,
    pub catalog_xmin: u64,
}

/// Pageserver progress snapshot relayed by a safekeeper.
///
/// Serialized as an extensible key/value block: unknown keys are skipped by
/// their declared length so either side can grow the set independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageserverFeedback {
    /// Current materialized size of the timeline, in bytes.
    pub current_timeline_size: u64,
    pub last_received_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    pub remote_consistent_lsn: Lsn,
    pub reply_time: i64,
}

impl PageserverFeedback {
    /// Parse a key/value block, consuming `buf` to its end.
    pub fn parse(buf: &mut Bytes) -> Result<PageserverFeedback, WireError> {
        let mut feedback = PageserverFeedback::default();
        let nkeys = take_u8(buf)?;
        for _ in 0..nkeys {
            let key = take_key(buf)?;
            let len = take_u32(buf)?;
            match key.as_str() {
                "current_timeline_size" => {
                    feedback.current_timeline_size = take_value_u64(buf, &key, len)?;
                }
                "ps_writelsn" | "last_received_lsn" => {
                    feedback.last_received_lsn = Lsn(take_value_u64(buf, &key, len)?);
                }
                "ps_flushlsn" | "disk_consistent_lsn" => {
                    feedback.disk_consistent_lsn = Lsn(take_value_u64(buf, &key, len)?);
                }
                "ps_applylsn" | "remote_consistent_lsn" => {
                    feedback.remote_consistent_lsn = Lsn(take_value_u64(buf, &key, len)?);
                }
                "ps_replytime" | "replytime" => {
                    if len != 8 {
                        return Err(WireError::BadValueLength { key, len });
                    }
                    feedback.reply_time = take_i64(buf)?;
                }
                _ => {
                    debug!(key = %key, len, "skipping unknown feedback key");
                    take_bytes(buf, len as usize)?;
                }
            }
        }
        Ok(feedback)
    }

    /// Serialize with the canonical key names.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(5);
        put_kv_u64(buf, "current_timeline_size", self.current_timeline_size);
        put_kv_u64(buf, "last_received_lsn", self.last_received_lsn.0);
        put_kv_u64(buf, "disk_consistent_lsn", self.disk_consistent_lsn.0);
        put_kv_u64(buf, "remote_consistent_lsn", self.remote_consistent_lsn.0);
        put_key(buf, "replytime");
        buf.put_u32_le(8);
        buf.put_i64_le(self.reply_time);
    }
}

fn take_key(buf: &mut Bytes) -> Result<String, WireError> {
    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(WireError::Truncated);
    };
    let key = buf.split_to(end);
    let _ = buf.split_to(1); // terminator
    String::from_utf8(key.to_vec()).map_err(|_| WireError::Truncated)
}

fn take_value_u64(buf: &mut Bytes, key: &str, len: u32) -> Result<u64, WireError> {
    if len != 8 {
        return Err(WireError::BadValueLength {
            key: key.to_owned(),
            len,
        });
    }
    crate::messages::take_u64(buf)
}

fn put_key(buf: &mut BytesMut, key: &str) {
    buf.put_slice(key.as_bytes());
    buf.put_u8(0);
}

fn put_kv_u64(buf: &mut BytesMut, key: &str, value: u64) {
    put_key(buf, key);
    buf.put_u32_le(8);
    buf.put_u64_le(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_canonical_encoding() {
        let feedback = PageserverFeedback {
            current_timeline_size: 1 << 30,
            last_received_lsn: Lsn(0x500),
            disk_consistent_lsn: Lsn(0x400),
            remote_consistent_lsn: Lsn(0x300),
            reply_time: 712_793_991_000_000,
        };
        let mut buf = BytesMut::new();
        feedback.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(PageserverFeedback::parse(&mut bytes).unwrap(), feedback);
        assert!(bytes.is_empty());
    }

    #[test]
    fn legacy_key_names_are_understood() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_slice(b"ps_writelsn\0");
        buf.put_u32_le(8);
        buf.put_u64_le(0x42);
        buf.put_slice(b"ps_applylsn\0");
        buf.put_u32_le(8);
        buf.put_u64_le(0x17);

        let feedback = PageserverFeedback::parse(&mut buf.freeze()).unwrap();
        assert_eq!(feedback.last_received_lsn, Lsn(0x42));
        assert_eq!(feedback.remote_consistent_lsn, Lsn(0x17));
    }

    #[test]
    fn unknown_keys_are_skipped_by_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_slice(b"last_received_lsn\0");
        buf.put_u32_le(8);
        buf.put_u64_le(0x99);
        buf.put_slice(b"shard_number\0");
        buf.put_u32_le(4);
        buf.put_u32_le(7);
        buf.put_slice(b"disk_consistent_lsn\0");
        buf.put_u32_le(8);
        buf.put_u64_le(0x88);

        let feedback = PageserverFeedback::parse(&mut buf.freeze()).unwrap();
        assert_eq!(feedback.last_received_lsn, Lsn(0x99));
        assert_eq!(feedback.disk_consistent_lsn, Lsn(0x88));
    }

    #[test]
    fn known_key_with_wrong_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_slice(b"disk_consistent_lsn\0");
        buf.put_u32_le(4);
        buf.put_u32_le(7);

        let err = PageserverFeedback::parse(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::BadValueLength { len: 4, .. }));
    }

    #[test]
    fn truncated_value_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_slice(b"whatever\0");
        buf.put_u32_le(16);
        buf.put_u32_le(7);

        assert!(matches!(
            PageserverFeedback::parse(&mut buf.freeze()),
            Err(WireError::Truncated)
        ));
    }
}
