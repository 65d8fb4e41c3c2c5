//! Framed protocol messages.
//!
//! Every message travels as one transport frame. Integers are
//! little-endian; log positions and terms are 64-bit; identifiers are raw
//! 16-byte values. The first eight bytes of a frame carry the message tag.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::feedback::{HotStandbyFeedback, PageserverFeedback};
use crate::history::{TermHistory, TermSwitchEntry};
use crate::lsn::Lsn;
use crate::types::{NodeId, TenantId, Term, TimelineId};

const TAG_GREETING: u64 = b'g' as u64;
const TAG_VOTE: u64 = b'v' as u64;
const TAG_ELECTED: u64 = b'e' as u64;
const TAG_APPEND: u64 = b'a' as u64;

/// Malformed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Frame ended before the message did.
    Truncated,
    /// The tag byte names no known message.
    UnknownTag(u64),
    /// Bytes left over after a complete message.
    TrailingBytes(usize),
    /// A feedback value had an impossible declared length.
    BadValueLength { key: String, len: u32 },
    /// Append payload length disagrees with the header's LSN range.
    BadPayloadLength { expected: u64, got: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => f.write_str("truncated message"),
            WireError::UnknownTag(tag) => write!(f, "unknown message tag {tag:#x}"),
            WireError::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
            WireError::BadValueLength { key, len } => {
                write!(f, "feedback key {key:?} has impossible value length {len}")
            }
            WireError::BadPayloadLength { expected, got } => {
                write!(f, "append payload is {got} bytes, header says {expected}")
            }
        }
    }
}

impl std::error::Error for WireError {}

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    let bytes = take_bytes(buf, 1)?;
    Ok(bytes[0])
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    let bytes = take_bytes(buf, 4)?;
    Ok(u32::from_le_bytes(bytes.as_ref().try_into().unwrap()))
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    let bytes = take_bytes(buf, 8)?;
    Ok(u64::from_le_bytes(bytes.as_ref().try_into().unwrap()))
}

pub(crate) fn take_i64(buf: &mut Bytes) -> Result<i64, WireError> {
    let bytes = take_bytes(buf, 8)?;
    Ok(i64::from_le_bytes(bytes.as_ref().try_into().unwrap()))
}

pub(crate) fn take_bytes(buf: &mut Bytes, n: usize) -> Result<Bytes, WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated);
    }
    Ok(buf.split_to(n))
}

fn take_lsn(buf: &mut Bytes) -> Result<Lsn, WireError> {
    take_u64(buf).map(Lsn)
}

fn take_term(buf: &mut Bytes) -> Result<Term, WireError> {
    take_u64(buf).map(Term)
}

fn take_uuid(buf: &mut Bytes) -> Result<Uuid, WireError> {
    let bytes = take_bytes(buf, 16)?;
    Ok(Uuid::from_bytes(bytes.as_ref().try_into().unwrap()))
}

fn take_id16(buf: &mut Bytes) -> Result<[u8; 16], WireError> {
    let bytes = take_bytes(buf, 16)?;
    Ok(bytes.as_ref().try_into().unwrap())
}

fn take_history(buf: &mut Bytes) -> Result<TermHistory, WireError> {
    let n = take_u32(buf)? as usize;
    if buf.len() < n * 16 {
        return Err(WireError::Truncated);
    }
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let term = take_term(buf)?;
        let lsn = take_lsn(buf)?;
        entries.push(TermSwitchEntry { term, lsn });
    }
    Ok(TermHistory(entries))
}

fn put_history(buf: &mut BytesMut, history: &TermHistory) {
    buf.put_u32_le(u32::try_from(history.len()).expect("term history length fits in u32"));
    for entry in &history.0 {
        buf.put_u64_le(entry.term.0);
        buf.put_u64_le(entry.lsn.0);
    }
}

fn finish(buf: &Bytes) -> Result<(), WireError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes(buf.len()))
    }
}

/// First message of the handshake, identifying the proposer and its log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposerGreeting {
    pub protocol_version: u32,
    pub pg_version: u32,
    pub proposer_id: Uuid,
    pub system_id: u64,
    pub timeline_id: TimelineId,
    pub tenant_id: TenantId,
    pub timeline: u32,
    pub wal_seg_size: u32,
}

/// Ask a safekeeper to vote for `term`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VoteRequest {
    pub term: Term,
    pub proposer_id: Uuid,
}

/// Announce the election result and the agreed history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposerElected {
    pub term: Term,
    /// The proposer streams to this safekeeper from here on; the
    /// safekeeper must discard anything it holds past this point.
    pub start_streaming_at: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

/// Fixed header preceding each streamed WAL chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendRequestHeader {
    pub term: Term,
    /// Position since which this proposer writes WAL; the epoch switch
    /// point.
    pub epoch_start_lsn: Lsn,
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub proposer_id: Uuid,
}

/// WAL chunk: header plus the raw bytes of `[begin_lsn, end_lsn)`.
///
/// An empty range is a heartbeat carrying fresh commit/truncate positions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendRequest {
    pub hdr: AppendRequestHeader,
    pub wal: Bytes,
}

/// Any proposer-to-safekeeper message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposerMessage {
    Greeting(ProposerGreeting),
    VoteRequest(VoteRequest),
    Elected(ProposerElected),
    Append(AppendRequest),
}

impl ProposerMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ProposerMessage::Greeting(m) => {
                buf.put_u64_le(TAG_GREETING);
                buf.put_u32_le(m.protocol_version);
                buf.put_u32_le(m.pg_version);
                buf.put_slice(m.proposer_id.as_bytes());
                buf.put_u64_le(m.system_id);
                buf.put_slice(m.timeline_id.as_bytes());
                buf.put_slice(m.tenant_id.as_bytes());
                buf.put_u32_le(m.timeline);
                buf.put_u32_le(m.wal_seg_size);
            }
            ProposerMessage::VoteRequest(m) => {
                buf.put_u64_le(TAG_VOTE);
                buf.put_u64_le(m.term.0);
                buf.put_slice(m.proposer_id.as_bytes());
            }
            ProposerMessage::Elected(m) => {
                buf.put_u64_le(TAG_ELECTED);
                buf.put_u64_le(m.term.0);
                buf.put_u64_le(m.start_streaming_at.0);
                put_history(buf, &m.term_history);
                buf.put_u64_le(m.timeline_start_lsn.0);
            }
            ProposerMessage::Append(m) => {
                buf.put_u64_le(TAG_APPEND);
                buf.put_u64_le(m.hdr.term.0);
                buf.put_u64_le(m.hdr.epoch_start_lsn.0);
                buf.put_u64_le(m.hdr.begin_lsn.0);
                buf.put_u64_le(m.hdr.end_lsn.0);
                buf.put_u64_le(m.hdr.commit_lsn.0);
                buf.put_u64_le(m.hdr.truncate_lsn.0);
                buf.put_slice(m.hdr.proposer_id.as_bytes());
                buf.put_slice(&m.wal);
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<ProposerMessage, WireError> {
        let tag = take_u64(&mut buf)?;
        match tag {
            TAG_GREETING => {
                let msg = ProposerGreeting {
                    protocol_version: take_u32(&mut buf)?,
                    pg_version: take_u32(&mut buf)?,
                    proposer_id: take_uuid(&mut buf)?,
                    system_id: take_u64(&mut buf)?,
                    timeline_id: TimelineId::from_bytes(take_id16(&mut buf)?),
                    tenant_id: TenantId::from_bytes(take_id16(&mut buf)?),
                    timeline: take_u32(&mut buf)?,
                    wal_seg_size: take_u32(&mut buf)?,
                };
                finish(&buf)?;
                Ok(ProposerMessage::Greeting(msg))
            }
            TAG_VOTE => {
                let msg = VoteRequest {
                    term: take_term(&mut buf)?,
                    proposer_id: take_uuid(&mut buf)?,
                };
                finish(&buf)?;
                Ok(ProposerMessage::VoteRequest(msg))
            }
            TAG_ELECTED => {
                let msg = ProposerElected {
                    term: take_term(&mut buf)?,
                    start_streaming_at: take_lsn(&mut buf)?,
                    term_history: take_history(&mut buf)?,
                    timeline_start_lsn: take_lsn(&mut buf)?,
                };
                finish(&buf)?;
                Ok(ProposerMessage::Elected(msg))
            }
            TAG_APPEND => {
                let hdr = AppendRequestHeader {
                    term: take_term(&mut buf)?,
                    epoch_start_lsn: take_lsn(&mut buf)?,
                    begin_lsn: take_lsn(&mut buf)?,
                    end_lsn: take_lsn(&mut buf)?,
                    commit_lsn: take_lsn(&mut buf)?,
                    truncate_lsn: take_lsn(&mut buf)?,
                    proposer_id: take_uuid(&mut buf)?,
                };
                if hdr.end_lsn < hdr.begin_lsn {
                    return Err(WireError::BadPayloadLength {
                        expected: 0,
                        got: buf.len(),
                    });
                }
                let expected = hdr.end_lsn - hdr.begin_lsn;
                if buf.len() as u64 != expected {
                    return Err(WireError::BadPayloadLength {
                        expected,
                        got: buf.len(),
                    });
                }
                Ok(ProposerMessage::Append(AppendRequest { hdr, wal: buf }))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// A safekeeper announces itself: highest term voted for, node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptorGreeting {
    pub term: Term,
    pub node_id: NodeId,
}

/// A safekeeper's vote, with everything needed to pick the donor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_given: u64,
    /// End of this safekeeper's WAL.
    pub flush_lsn: Lsn,
    /// Everything below this is already safe on every safekeeper.
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

impl VoteResponse {
    #[must_use]
    pub fn granted(&self) -> bool {
        self.vote_given != 0
    }
}

/// Progress report acknowledging appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendResponse {
    /// Safekeeper's current term; a higher value than ours means another
    /// proposer took over.
    pub term: Term,
    pub flush_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub hs: HotStandbyFeedback,
    pub ps: Option<PageserverFeedback>,
}

/// Any safekeeper-to-proposer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptorMessage {
    Greeting(AcceptorGreeting),
    Vote(VoteResponse),
    Append(AppendResponse),
}

impl AcceptorMessage {
    /// Message kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            AcceptorMessage::Greeting(_) => "greeting",
            AcceptorMessage::Vote(_) => "vote",
            AcceptorMessage::Append(_) => "append",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AcceptorMessage::Greeting(m) => {
                buf.put_u64_le(TAG_GREETING);
                buf.put_u64_le(m.term.0);
                buf.put_u64_le(m.node_id.0);
            }
            AcceptorMessage::Vote(m) => {
                buf.put_u64_le(TAG_VOTE);
                buf.put_u64_le(m.term.0);
                buf.put_u64_le(m.vote_given);
                buf.put_u64_le(m.flush_lsn.0);
                buf.put_u64_le(m.truncate_lsn.0);
                put_history(buf, &m.term_history);
                buf.put_u64_le(m.timeline_start_lsn.0);
            }
            AcceptorMessage::Append(m) => {
                buf.put_u64_le(TAG_APPEND);
                buf.put_u64_le(m.term.0);
                buf.put_u64_le(m.flush_lsn.0);
                buf.put_u64_le(m.commit_lsn.0);
                buf.put_i64_le(m.hs.ts);
                buf.put_u64_le(m.hs.xmin);
                buf.put_u64_le(m.hs.catalog_xmin);
                if let Some(ps) = &m.ps {
                    ps.encode(buf);
                }
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<AcceptorMessage, WireError> {
        let tag = take_u64(&mut buf)?;
        match tag {
            TAG_GREETING => {
                let msg = AcceptorGreeting {
                    term: take_term(&mut buf)?,
                    node_id: NodeId(take_u64(&mut buf)?),
                };
                finish(&buf)?;
                Ok(AcceptorMessage::Greeting(msg))
            }
            TAG_VOTE => {
                let msg = VoteResponse {
                    term: take_term(&mut buf)?,
                    vote_given: take_u64(&mut buf)?,
                    flush_lsn: take_lsn(&mut buf)?,
                    truncate_lsn: take_lsn(&mut buf)?,
                    term_history: take_history(&mut buf)?,
                    timeline_start_lsn: take_lsn(&mut buf)?,
                };
                finish(&buf)?;
                Ok(AcceptorMessage::Vote(msg))
            }
            TAG_APPEND => {
                let mut msg = AppendResponse {
                    term: take_term(&mut buf)?,
                    flush_lsn: take_lsn(&mut buf)?,
                    commit_lsn: take_lsn(&mut buf)?,
                    hs: HotStandbyFeedback {
                        ts: take_i64(&mut buf)?,
                        xmin: take_u64(&mut buf)?,
                        catalog_xmin: take_u64(&mut buf)?,
                    },
                    ps: None,
                };
                // The feedback block is optional and extensible.
                if !buf.is_empty() {
                    msg.ps = Some(PageserverFeedback::parse(&mut buf)?);
                }
                finish(&buf)?;
                Ok(AcceptorMessage::Append(msg))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}
