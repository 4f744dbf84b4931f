//! Uncompressed layout of replication messages and initial-load streams.
//!
//! A live message is `[u16 BE length][UTF-8 replicable id]` followed by any number of
//! `[u32 BE length][operation bytes]` records, all belonging to that one replicable. An
//! initial-load stream is a sequence of sections `[u16 BE length][UTF-8 replicable id]
//! [u64 BE length][snapshot bytes]` in the order the replica requested them.

use crate::error::{ReplError, Result};
use crate::operation::ReplicableId;
use bytes::{Buf, Bytes};
use std::io::Write;

/// Bytes of the length prefix in front of an operation record.
pub const RECORD_PREFIX_LEN: usize = 4;

/// Write the replicable-id header. Returns the number of bytes written.
pub fn write_header<W: Write + ?Sized>(out: &mut W, replicable_id: &ReplicableId) -> Result<usize> {
    let id = replicable_id.as_str().as_bytes();
    let len = u16::try_from(id.len()).map_err(|_| {
        ReplError::wire(format!(
            "replicable id of {} bytes exceeds header limit",
            id.len()
        ))
    })?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(id)?;
    Ok(2 + id.len())
}

/// Write one operation record. Returns the number of bytes written.
pub fn write_operation<W: Write + ?Sized>(out: &mut W, payload: &[u8]) -> Result<usize> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ReplError::wire("operation record exceeds 4 GiB"))?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(payload)?;
    Ok(RECORD_PREFIX_LEN + payload.len())
}

/// Encode a complete uncompressed message.
pub fn encode_message(replicable_id: &ReplicableId, operations: &[Bytes]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, replicable_id)?;
    for op in operations {
        write_operation(&mut out, op)?;
    }
    Ok(out)
}

/// A decoded live message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Replicable every record belongs to.
    pub replicable_id: ReplicableId,
    /// Serialized operations in production order.
    pub operations: Vec<Bytes>,
}

fn read_header(buf: &mut Bytes) -> Result<ReplicableId> {
    if buf.remaining() < 2 {
        return Err(ReplError::wire("truncated replicable id header"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ReplError::wire(format!(
            "replicable id header announces {} bytes, {} left",
            len,
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len);
    let id = std::str::from_utf8(&raw)
        .map_err(|_| ReplError::wire("replicable id is not valid UTF-8"))?;
    Ok(ReplicableId::new(id))
}

/// Decode an uncompressed message.
pub fn decode_message(mut buf: Bytes) -> Result<InboundMessage> {
    let replicable_id = read_header(&mut buf)?;
    let mut operations = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < RECORD_PREFIX_LEN {
            return Err(ReplError::wire("truncated operation record prefix"));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(ReplError::wire(format!(
                "operation record announces {} bytes, {} left",
                len,
                buf.remaining()
            )));
        }
        operations.push(buf.split_to(len));
    }
    Ok(InboundMessage {
        replicable_id,
        operations,
    })
}

/// Write one initial-load section.
pub fn write_snapshot_section<W: Write + ?Sized>(
    out: &mut W,
    replicable_id: &ReplicableId,
    snapshot: &[u8],
) -> Result<()> {
    write_header(out, replicable_id)?;
    out.write_all(&(snapshot.len() as u64).to_be_bytes())?;
    out.write_all(snapshot)?;
    Ok(())
}

/// Reads the sections of a decompressed initial-load stream.
pub struct SnapshotSections {
    buf: Bytes,
}

impl SnapshotSections {
    /// Wrap a decompressed initial-load stream.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Next section, which must belong to `expected`.
    pub fn next_section(&mut self, expected: &ReplicableId) -> Result<Bytes> {
        let id = read_header(&mut self.buf)?;
        if &id != expected {
            return Err(ReplError::wire(format!(
                "initial load out of order: expected {}, got {}",
                expected, id
            )));
        }
        if self.buf.remaining() < 8 {
            return Err(ReplError::wire("truncated snapshot length"));
        }
        let len = self.buf.get_u64();
        if (self.buf.remaining() as u64) < len {
            return Err(ReplError::wire(format!(
                "snapshot of {} announces {} bytes, {} left",
                id,
                len,
                self.buf.remaining()
            )));
        }
        Ok(self.buf.split_to(len as usize))
    }

    /// Returns true once every section was read.
    pub fn is_exhausted(&self) -> bool {
        !self.buf.has_remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_message_layout() {
        let encoded = encode_message(&"ab".into(), &[Bytes::from_static(b"xyz")]).unwrap();
        assert_eq!(encoded, vec![0, 2, b'a', b'b', 0, 0, 0, 3, b'x', b'y', b'z']);
    }

    #[test]
    fn test_header_only_message_has_no_operations() {
        let encoded = encode_message(&"race-1".into(), &[]).unwrap();
        let decoded = decode_message(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded.replicable_id, ReplicableId::from("race-1"));
        assert!(decoded.operations.is_empty());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut encoded = encode_message(&"r".into(), &[Bytes::from_static(b"abcdef")]).unwrap();
        encoded.truncate(encoded.len() - 2);
        let err = decode_message(Bytes::from(encoded)).unwrap_err();
        assert!(matches!(err, ReplError::Wire { .. }));
    }

    #[test]
    fn test_oversized_id_rejected() {
        let id = ReplicableId::new("x".repeat(70_000));
        assert!(encode_message(&id, &[]).is_err());
    }

    #[test]
    fn test_invalid_utf8_id_rejected() {
        let raw = Bytes::from_static(&[0, 2, 0xff, 0xfe]);
        assert!(decode_message(raw).is_err());
    }

    #[test]
    fn test_snapshot_sections_in_order() {
        let mut stream = Vec::new();
        write_snapshot_section(&mut stream, &"a".into(), b"state-a").unwrap();
        write_snapshot_section(&mut stream, &"b".into(), b"").unwrap();

        let mut sections = SnapshotSections::new(Bytes::from(stream));
        assert_eq!(sections.next_section(&"a".into()).unwrap(), &b"state-a"[..]);
        assert!(!sections.is_exhausted());
        assert!(sections.next_section(&"b".into()).unwrap().is_empty());
        assert!(sections.is_exhausted());
    }

    #[test]
    fn test_snapshot_section_order_mismatch() {
        let mut stream = Vec::new();
        write_snapshot_section(&mut stream, &"b".into(), b"state-b").unwrap();
        let mut sections = SnapshotSections::new(Bytes::from(stream));
        let err = sections.next_section(&"a".into()).unwrap_err();
        assert!(err.to_string().contains("expected a, got b"));
    }

    proptest! {
        #[test]
        fn prop_message_preserves_records(
            id in "[a-z0-9-]{0,40}",
            ops in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16),
        ) {
            let ops: Vec<Bytes> = ops.into_iter().map(Bytes::from).collect();
            let encoded = encode_message(&ReplicableId::new(id.clone()), &ops).unwrap();
            let decoded = decode_message(Bytes::from(encoded)).unwrap();
            prop_assert_eq!(decoded.replicable_id.as_str(), id.as_str());
            prop_assert_eq!(decoded.operations, ops);
        }

        #[test]
        fn prop_truncation_never_panics(
            ops in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 1..8),
            cut in 0usize..512,
        ) {
            let ops: Vec<Bytes> = ops.into_iter().map(Bytes::from).collect();
            let encoded = encode_message(&"race".into(), &ops).unwrap();
            let cut = cut.min(encoded.len());
            let _ = decode_message(Bytes::copy_from_slice(&encoded[..cut]));
        }
    }
}
