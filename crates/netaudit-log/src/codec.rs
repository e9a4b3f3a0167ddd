//! Stored record layout
//!
//! Every record occupies one slot of the ring buffer. A slot starts with a
//! fixed 48 byte header, followed by the fixed part of its shape and the
//! variable length strings. All integers are little endian.
//!
//! ```text
//! header   0  len u64 (slot size, aligned)   8  kind u32   12  pad
//!         16  timestamp_ns u64
//!         24  pid  28 tid  32 ppid  36 uid  40 gid (u32)  44 pad
//! network 48  path_len u32  52 protocol u8  53 action u8  54 family u16
//!         56  src_port u16  58 dst_port u16  60 pad
//!         64  src[16]  80 dst[16]  96 path
//! exec    48  path_len u32  52 argv_len u32  56 path, argv
//! ```
//!
//! A zero `len` at an offset is the wrap sentinel: the record really lives at
//! offset 0. [`decode_at`] is the only place that interprets it.

use netaudit_core::events::network::ADDR_SLOT_LEN;
use netaudit_core::{
    Action, AddressFamily, Endpoint, ExecEvent, NetworkEvent, ProcessDetails, ProcessIdentity,
    Protocol, RecordBody, RecordKind,
};

/// Alignment of every slot
pub const RECORD_ALIGN: usize = 8;

/// Size of the common header
pub const HEADER_LEN: usize = 48;

/// Header plus the fixed part of a network record
pub const NETWORK_FIXED_LEN: usize = 96;

/// Header plus the fixed part of an execution record
pub const EXEC_FIXED_LEN: usize = 56;

/// Smallest supported buffer
pub const MIN_CAPACITY: usize = 4096;

const LEN_FIELD: usize = 8;

/// Round `len` up to the slot alignment
pub fn align_up(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// A record about to be written. Strings are already truncated.
#[derive(Debug, Clone, Copy)]
pub enum RecordPayload<'a> {
    Network {
        path: &'a [u8],
        action: Action,
        protocol: Protocol,
        family: AddressFamily,
        src: Endpoint,
        dst: Endpoint,
    },
    Execution {
        path: &'a [u8],
        argv: &'a [u8],
    },
}

impl<'a> RecordPayload<'a> {
    pub fn network(event: &'a NetworkEvent, path: &'a [u8]) -> Self {
        RecordPayload::Network {
            path,
            action: event.action,
            protocol: event.protocol,
            family: event.family,
            src: event.src,
            dst: event.dst,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Network { .. } => RecordKind::Network,
            RecordPayload::Execution { .. } => RecordKind::Execution,
        }
    }

    /// Bytes the record occupies in the buffer
    pub fn slot_len(&self) -> usize {
        let raw = match self {
            RecordPayload::Network { path, .. } => NETWORK_FIXED_LEN + path.len(),
            RecordPayload::Execution { path, argv } => EXEC_FIXED_LEN + path.len() + argv.len(),
        };
        align_up(raw)
    }
}

/// Serialize `payload` into `slot`, which must be exactly `payload.slot_len()` long
pub fn encode(slot: &mut [u8], details: &ProcessDetails, payload: &RecordPayload<'_>) {
    slot.fill(0);
    put_u64(slot, 0, slot.len() as u64);
    put_u32(slot, 8, payload.kind() as u32);
    put_u64(slot, 16, details.timestamp_ns);
    let id = &details.identity;
    put_u32(slot, 24, id.pid);
    put_u32(slot, 28, id.tid);
    put_u32(slot, 32, id.ppid);
    put_u32(slot, 36, id.uid);
    put_u32(slot, 40, id.gid);

    match payload {
        RecordPayload::Network {
            path,
            action,
            protocol,
            family,
            src,
            dst,
        } => {
            put_u32(slot, 48, path.len() as u32);
            slot[52] = *protocol as u8;
            slot[53] = *action as u8;
            put_u16(slot, 54, *family as u16);
            put_u16(slot, 56, src.port);
            put_u16(slot, 58, dst.port);
            slot[64..80].copy_from_slice(&src.addr_slot());
            slot[80..96].copy_from_slice(&dst.addr_slot());
            slot[NETWORK_FIXED_LEN..NETWORK_FIXED_LEN + path.len()].copy_from_slice(path);
        }
        RecordPayload::Execution { path, argv } => {
            put_u32(slot, 48, path.len() as u32);
            put_u32(slot, 52, argv.len() as u32);
            let argv_at = EXEC_FIXED_LEN + path.len();
            slot[EXEC_FIXED_LEN..argv_at].copy_from_slice(path);
            slot[argv_at..argv_at + argv.len()].copy_from_slice(argv);
        }
    }
}

/// Mark `offset` as the wrap point
pub fn write_sentinel(buf: &mut [u8], offset: usize) {
    if let Some(field) = buf.get_mut(offset..offset + LEN_FIELD) {
        field.fill(0);
    }
}

/// What a slot holds, as far as it can be understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    Complete(RecordBody),
    /// Stored length too short for the shape, or inconsistent string lengths
    Broken(RecordKind),
    /// Unrecognized discriminant
    Unknown(u32),
}

/// A decoded slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub details: ProcessDetails,
    pub content: StoredContent,
}

/// Result of [`decode_at`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Offset the record actually starts at (0 after a sentinel)
    pub offset: usize,
    /// Offset of the following record
    pub successor: usize,
    pub record: StoredRecord,
}

/// Offset the record referenced by `offset` really starts at
pub fn resolve(buf: &[u8], offset: usize) -> usize {
    match get_u64(buf, offset) {
        Some(0) | None => 0,
        Some(_) => offset,
    }
}

/// Offset of the record following the one referenced by `offset`
pub fn successor(buf: &[u8], offset: usize) -> usize {
    let start = resolve(buf, offset);
    let len = get_u64(buf, start).unwrap_or(0) as usize;
    (start + len.max(LEN_FIELD)).min(buf.len())
}

/// Decode the record referenced by `offset`, following the wrap sentinel
pub fn decode_at(buf: &[u8], offset: usize) -> Located {
    let start = resolve(buf, offset);
    let successor = successor(buf, offset);
    let slot = &buf[start..successor];

    let details = decode_details(slot).unwrap_or_default();
    let raw_kind = get_u32(slot, 8).unwrap_or(0);
    let content = match RecordKind::from_raw(raw_kind) {
        Some(RecordKind::Network) => decode_network(slot)
            .map(RecordBody::Network)
            .map_or(StoredContent::Broken(RecordKind::Network), StoredContent::Complete),
        Some(RecordKind::Execution) => decode_exec(slot)
            .map(RecordBody::Execution)
            .map_or(StoredContent::Broken(RecordKind::Execution), StoredContent::Complete),
        None => StoredContent::Unknown(raw_kind),
    };

    Located {
        offset: start,
        successor,
        record: StoredRecord { details, content },
    }
}

fn decode_details(slot: &[u8]) -> Option<ProcessDetails> {
    Some(ProcessDetails {
        timestamp_ns: get_u64(slot, 16)?,
        identity: ProcessIdentity {
            pid: get_u32(slot, 24)?,
            tid: get_u32(slot, 28)?,
            ppid: get_u32(slot, 32)?,
            uid: get_u32(slot, 36)?,
            gid: get_u32(slot, 40)?,
        },
    })
}

fn decode_network(slot: &[u8]) -> Option<NetworkEvent> {
    if slot.len() < NETWORK_FIXED_LEN {
        return None;
    }
    let path_len = get_u32(slot, 48)? as usize;
    let path = slot.get(NETWORK_FIXED_LEN..NETWORK_FIXED_LEN + path_len)?;
    let protocol = Protocol::from_raw(slot[52])?;
    let action = Action::from_raw(slot[53])?;
    let family = AddressFamily::from_raw(get_u16(slot, 54)?)?;
    let src = Endpoint::from_slot(family, &addr_slot(slot, 64)?, get_u16(slot, 56)?);
    let dst = Endpoint::from_slot(family, &addr_slot(slot, 80)?, get_u16(slot, 58)?);

    Some(NetworkEvent {
        path: String::from_utf8_lossy(path).into_owned(),
        action,
        protocol,
        family,
        src,
        dst,
    })
}

fn decode_exec(slot: &[u8]) -> Option<ExecEvent> {
    if slot.len() < EXEC_FIXED_LEN {
        return None;
    }
    let path_len = get_u32(slot, 48)? as usize;
    let argv_len = get_u32(slot, 52)? as usize;
    let argv_at = EXEC_FIXED_LEN + path_len;
    let path = slot.get(EXEC_FIXED_LEN..argv_at)?;
    let argv = slot.get(argv_at..argv_at + argv_len)?;
    Some(ExecEvent::new(String::from_utf8_lossy(path), argv))
}

fn addr_slot(buf: &[u8], at: usize) -> Option<[u8; ADDR_SLOT_LEN]> {
    buf.get(at..at + ADDR_SLOT_LEN)?.try_into().ok()
}

fn get_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn get_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn get_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
