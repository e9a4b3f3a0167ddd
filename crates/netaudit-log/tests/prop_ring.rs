//! Property-based tests for the ring buffer and reader sessions.
//!
//! Invariants checked for arbitrary append sequences:
//! - `next` advances by exactly one sequence number per append
//! - retained records form an unbroken chain from `first` to `next`
//! - every write leaves room for a sentinel and wrapped writes start at 0
//! - a lagging session sees one loss signal, then consecutive records

use netaudit_core::{
    create_metrics, Action, AddressFamily, Endpoint, ProcessDetails, ProcessIdentity, Protocol,
    RecordBody,
};
use netaudit_log::codec::{RecordPayload, StoredContent, HEADER_LEN};
use netaudit_log::{AuditLog, ReadError, RingBuffer};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Shape {
    Network { path_len: usize, port: u16, v6: bool },
    Execution { path_len: usize, argv_len: usize },
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    prop_oneof![
        (1usize..200, any::<u16>(), any::<bool>()).prop_map(|(path_len, port, v6)| {
            Shape::Network { path_len, port, v6 }
        }),
        (1usize..120, 0usize..120)
            .prop_map(|(path_len, argv_len)| Shape::Execution { path_len, argv_len }),
    ]
}

fn capacity_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(4096usize), Just(6144usize), Just(8192usize)]
}

static BYTES: [u8; 256] = [b'q'; 256];

fn payload(shape: &Shape) -> RecordPayload<'static> {
    match *shape {
        Shape::Network { path_len, port, v6 } => {
            let family = if v6 {
                AddressFamily::Inet6
            } else {
                AddressFamily::Inet
            };
            RecordPayload::Network {
                path: &BYTES[..path_len],
                action: Action::Connect,
                protocol: Protocol::Tcp,
                family,
                src: Endpoint::new(family.unspecified(), 40000),
                dst: Endpoint::new(family.unspecified(), port),
            }
        }
        Shape::Execution { path_len, argv_len } => RecordPayload::Execution {
            path: &BYTES[..path_len],
            argv: &BYTES[..argv_len],
        },
    }
}

fn details(seq: u64) -> ProcessDetails {
    ProcessDetails::new(
        seq,
        ProcessIdentity {
            pid: seq as u32,
            ..Default::default()
        },
    )
}

fn pid_of(line: &str) -> u64 {
    line.split("pid=")
        .nth(1)
        .and_then(|rest| rest.split(' ').next())
        .and_then(|pid| pid.parse().ok())
        .unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Property: sequence numbers and framing
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn next_sequence_counts_appends(
        capacity in capacity_strategy(),
        shapes in prop::collection::vec(shape_strategy(), 1..300),
    ) {
        let mut ring = RingBuffer::new(capacity).unwrap();
        let start = ring.next().seq;
        for (i, shape) in shapes.iter().enumerate() {
            ring.append(&details(i as u64), &payload(shape)).unwrap();
            prop_assert_eq!(ring.next().seq, start + i as u64 + 1);
        }
        prop_assert_eq!(ring.next().seq, start + shapes.len() as u64);
    }

    #[test]
    fn retained_records_chain_to_next(
        capacity in capacity_strategy(),
        shapes in prop::collection::vec(shape_strategy(), 1..300),
    ) {
        let mut ring = RingBuffer::new(capacity).unwrap();
        for (i, shape) in shapes.iter().enumerate() {
            ring.append(&details(i as u64), &payload(shape)).unwrap();

            let mut expected = ring.first().seq;
            let mut end = ring.first().offset;
            for (seq, located) in ring.iter() {
                prop_assert_eq!(seq, expected);
                prop_assert_eq!(u64::from(located.record.details.identity.pid), seq);
                prop_assert!(matches!(located.record.content, StoredContent::Complete(_)));
                expected += 1;
                end = located.successor;
            }
            prop_assert_eq!(expected, ring.next().seq);
            prop_assert_eq!(end, ring.next().offset);
        }
    }

    #[test]
    fn writes_leave_room_for_sentinel(
        capacity in capacity_strategy(),
        shapes in prop::collection::vec(shape_strategy(), 1..300),
    ) {
        let mut ring = RingBuffer::new(capacity).unwrap();
        for (i, shape) in shapes.iter().enumerate() {
            let appended = ring.append(&details(i as u64), &payload(shape)).unwrap();
            prop_assert!(ring.next().offset + HEADER_LEN < capacity);
            if appended.wrapped {
                prop_assert_eq!(appended.at.offset, 0);
            }
            prop_assert_eq!(appended.slot_len % 8, 0);
        }
    }

    #[test]
    fn latest_record_decodes_to_what_was_written(
        shapes in prop::collection::vec(shape_strategy(), 1..100),
    ) {
        let mut ring = RingBuffer::new(4096).unwrap();
        for (i, shape) in shapes.iter().enumerate() {
            let appended = ring.append(&details(i as u64), &payload(shape)).unwrap();
            let located = ring.decode(appended.at);
            match (shape, located.record.content) {
                (Shape::Network { path_len, port, .. }, StoredContent::Complete(RecordBody::Network(event))) => {
                    prop_assert_eq!(event.path.len(), *path_len);
                    prop_assert_eq!(event.dst.port, *port);
                }
                (Shape::Execution { path_len, argv_len }, StoredContent::Complete(RecordBody::Execution(event))) => {
                    prop_assert_eq!(event.path.len(), *path_len);
                    prop_assert_eq!(event.argv.len(), *argv_len);
                }
                (shape, content) => prop_assert!(false, "{:?} decoded as {:?}", shape, content),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property: lagging sessions resynchronize
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn lagging_session_resyncs_once(
        appends in 1usize..400,
    ) {
        let log = AuditLog::new(4096, create_metrics()).unwrap();
        let mut session = log.open();
        session.set_nonblocking(true);

        for pid in 0..appends {
            let identity = ProcessIdentity { pid: pid as u32, ..Default::default() };
            log.record_execution_event(identity, "/bin/true", b"true\0");
        }

        let first = log.status().first;
        let mut expected = match session.read_line(8192) {
            Err(ReadError::DataLost { resumed_at }) => {
                prop_assert_eq!(resumed_at, first.seq);
                prop_assert_eq!(session.cursor(), first);
                first.seq
            }
            Ok(Some(line)) => {
                prop_assert_eq!(first.seq, 0);
                prop_assert_eq!(pid_of(&line), 0);
                1
            }
            other => {
                return Err(TestCaseError::fail(format!("unexpected first read {:?}", other)));
            }
        };

        loop {
            match session.read_line(8192) {
                Ok(Some(line)) => {
                    prop_assert_eq!(pid_of(&line), expected);
                    expected += 1;
                }
                Err(ReadError::WouldBlock) => break,
                other => prop_assert!(false, "unexpected read {:?}", other),
            }
        }
        prop_assert_eq!(expected, appends as u64);
    }
}
