use crate::proto::{self, Codec, OffsetRange};
use crate::session::{PartitionSession, SessionRegistry};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// A half-open offset interval the consumer has fully processed, together
/// with a non-owning reference to the partition session it belongs to.
#[derive(Clone)]
pub struct CommitRange {
    start: i64,
    end: i64,
    session: Weak<PartitionSession>,
}

impl CommitRange {
    pub(crate) fn new(start: i64, end: i64, session: &Arc<PartitionSession>) -> Self {
        Self {
            start,
            end,
            session: Arc::downgrade(session),
        }
    }

    /// A range naming no offsets and no session; committing it is a no-op.
    pub(crate) fn unbound() -> Self {
        Self {
            start: 0,
            end: 0,
            session: Weak::new(),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub(crate) fn session(&self) -> Option<Arc<PartitionSession>> {
        self.session.upgrade()
    }

    pub(crate) fn as_offset_range(&self) -> OffsetRange {
        OffsetRange {
            start: self.start,
            end: self.end,
        }
    }
}

impl std::fmt::Debug for CommitRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitRange([{}, {}))", self.start, self.end)
    }
}

enum Body {
    Pending { codec: Codec, data: Bytes },
    Active(Box<dyn Read + Send>),
    Done,
}

/// One consumer-visible message. The body is a lazy single-pass reader:
/// decompression happens on first `read`, and the bytes can be consumed once.
pub struct Message {
    pub seq_no: i64,
    pub created_at: SystemTime,
    pub written_at: SystemTime,
    pub producer_id: String,
    pub offset: i64,
    pub write_session_meta: Arc<HashMap<String, String>>,
    /// Body size after decompression, as reported by the broker.
    pub uncompressed_size: i64,

    raw_data_len: usize,
    /// Share of the owning frame's `bytes_size`, credited back to the flow
    /// window when this message leaves the staging buffer.
    pub(crate) buffer_bytes_account: i64,
    body: Body,
    commit_range: CommitRange,
}

impl Message {
    /// The commit range naming exactly this message, gaps included.
    pub fn commit_range(&self) -> &CommitRange {
        &self.commit_range
    }

    /// Length of the body as it arrived on the wire, before decompression.
    pub fn raw_data_len(&self) -> usize {
        self.raw_data_len
    }
}

impl Read for Message {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match &mut self.body {
                Body::Pending { .. } => {
                    let Body::Pending { codec, data } = std::mem::replace(&mut self.body, Body::Done)
                    else {
                        unreachable!()
                    };
                    let reader: Box<dyn Read + Send> = match codec {
                        Codec::Raw => Box::new(data.reader()),
                        Codec::Gzip => Box::new(flate2::read::GzDecoder::new(data.reader())),
                        Codec::Unsupported(_) => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                crate::Error::UnknownCodec(codec),
                            ));
                        }
                    };
                    self.body = Body::Active(reader);
                }
                Body::Active(reader) => {
                    let n = reader.read(buf)?;
                    if n == 0 && !buf.is_empty() {
                        self.body = Body::Done;
                    }
                    return Ok(n);
                }
                Body::Done => return Ok(0),
            }
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("offset", &self.offset)
            .field("seq_no", &self.seq_no)
            .field("producer_id", &self.producer_id)
            .field("commit_range", &self.commit_range)
            .finish()
    }
}

/// An ordered run of messages of one partition session. Adjacent messages
/// are offset-contiguous and the batch commit range spans them all.
pub struct Batch {
    pub messages: Vec<Message>,
    commit_range: CommitRange,
}

impl Batch {
    pub(crate) fn new(messages: Vec<Message>) -> Self {
        let commit_range = match (messages.first(), messages.last()) {
            (Some(first), Some(last)) => CommitRange {
                start: first.commit_range.start,
                end: last.commit_range.end,
                session: first.commit_range.session.clone(),
            },
            _ => CommitRange::unbound(),
        };
        Self {
            messages,
            commit_range,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn commit_range(&self) -> &CommitRange {
        &self.commit_range
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.messages.len())
            .field("commit_range", &self.commit_range)
            .finish()
    }
}

/// A decoded `ReadResponse`: staged messages grouped per session, plus any
/// frame bytes that could not be attributed to a message.
pub(crate) struct DecodedFrame {
    pub(crate) per_session: Vec<(Arc<PartitionSession>, Vec<Message>)>,
    pub(crate) unaccounted_bytes: i64,
}

impl DecodedFrame {
    pub(crate) fn messages_count(&self) -> usize {
        self.per_session.iter().map(|(_, m)| m.len()).sum()
    }
}

/// Turns a server data frame into per-session message runs.
///
/// Commit ranges are stitched over offset gaps: each message's range starts
/// where the previous one ended (beginning at the session's
/// `last_received_offset + 1`), so committing delivered messages also covers
/// offsets the broker skipped. The frame's `bytes_size` is apportioned
/// across its messages; only the total is meaningful and it always equals
/// the frame size.
pub(crate) fn decode_read_response(
    resp: proto::ReadResponse,
    registry: &SessionRegistry,
) -> crate::Result<DecodedFrame> {
    let mut per_session = Vec::new();

    for partition_data in resp.partition_data {
        let session = registry.get(partition_data.partition_session_id)?;
        let mut messages = Vec::new();
        let mut prev_end = session.stitch_base();

        for raw_batch in partition_data.batches {
            let write_session_meta = Arc::new(raw_batch.write_session_meta);
            for data in raw_batch.message_data {
                let commit_range = CommitRange::new(prev_end, data.offset + 1, &session);
                prev_end = data.offset + 1;
                messages.push(Message {
                    seq_no: data.seq_no,
                    created_at: data.created_at,
                    written_at: raw_batch.written_at,
                    producer_id: raw_batch.producer_id.clone(),
                    offset: data.offset,
                    write_session_meta: write_session_meta.clone(),
                    uncompressed_size: data.uncompressed_size,
                    raw_data_len: data.data.len(),
                    buffer_bytes_account: 0,
                    body: Body::Pending {
                        codec: raw_batch.codec,
                        data: data.data,
                    },
                    commit_range,
                });
            }
        }

        if let Some(last) = messages.last() {
            session.advance_last_received(last.offset);
        }
        if !messages.is_empty() {
            per_session.push((session, messages));
        }
    }

    let unaccounted_bytes = apportion_frame_bytes(resp.bytes_size, &mut per_session);

    Ok(DecodedFrame {
        per_session,
        unaccounted_bytes,
    })
}

/// Splits `bytes_size` across the frame's messages proportionally to raw
/// body length (uniformly when every body is empty), remainder on the last
/// message. Returns the frame size untouched when the frame staged nothing.
fn apportion_frame_bytes(
    bytes_size: i64,
    per_session: &mut [(Arc<PartitionSession>, Vec<Message>)],
) -> i64 {
    let count: usize = per_session.iter().map(|(_, m)| m.len()).sum();
    if count == 0 {
        return bytes_size;
    }
    let total_len: i64 = per_session
        .iter()
        .flat_map(|(_, m)| m.iter())
        .map(|m| m.raw_data_len as i64)
        .sum();

    let mut assigned = 0i64;
    let mut index = 0usize;
    for (_, messages) in per_session.iter_mut() {
        for message in messages.iter_mut() {
            index += 1;
            message.buffer_bytes_account = if index == count {
                bytes_size - assigned
            } else if total_len > 0 {
                bytes_size * message.raw_data_len as i64 / total_len
            } else {
                bytes_size / count as i64
            };
            assigned += message.buffer_bytes_account;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_time(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    fn gzip(body: &[u8]) -> Bytes {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn registry_with_session(id: i64, committed: i64) -> (SessionRegistry, Arc<PartitionSession>) {
        let registry = SessionRegistry::default();
        let session = PartitionSession::new(
            "/topic/test".to_string(),
            5,
            id,
            1,
            "conn".to_string(),
            committed,
            CancellationToken::new(),
        );
        registry.add(session.clone()).unwrap();
        (registry, session)
    }

    fn read_all(message: &mut Message) -> std::io::Result<Vec<u8>> {
        let mut body = Vec::new();
        message.read_to_end(&mut body)?;
        Ok(body)
    }

    #[test]
    fn decode_stitches_and_decompresses() {
        let (registry, session) = registry_with_session(15, 20);
        let prev = session.last_received_offset(); // 19

        let resp = proto::ReadResponse {
            bytes_size: 100,
            partition_data: vec![proto::PartitionData {
                partition_session_id: 15,
                batches: vec![
                    proto::RawBatch {
                        codec: Codec::Raw,
                        producer_id: "1".to_string(),
                        write_session_meta: HashMap::from([("a".to_string(), "b".to_string())]),
                        written_at: test_time(5),
                        message_data: vec![
                            proto::MessageData {
                                offset: prev + 1,
                                seq_no: 1,
                                created_at: test_time(1),
                                data: Bytes::from_static(b"123"),
                                uncompressed_size: 3,
                            },
                            proto::MessageData {
                                offset: prev + 2,
                                seq_no: 2,
                                created_at: test_time(2),
                                data: Bytes::from_static(b"4567"),
                                uncompressed_size: 4,
                            },
                        ],
                    },
                    proto::RawBatch {
                        codec: Codec::Gzip,
                        producer_id: "2".to_string(),
                        write_session_meta: HashMap::new(),
                        written_at: test_time(6),
                        message_data: vec![
                            proto::MessageData {
                                offset: prev + 10,
                                seq_no: 3,
                                created_at: test_time(3),
                                data: gzip(b"098"),
                                uncompressed_size: 3,
                            },
                            proto::MessageData {
                                offset: prev + 20,
                                seq_no: 4,
                                created_at: test_time(4),
                                data: gzip(b"0987"),
                                uncompressed_size: 4,
                            },
                        ],
                    },
                ],
            }],
        };

        let mut decoded = decode_read_response(resp, &registry).unwrap();
        assert_eq!(decoded.per_session.len(), 1);
        assert_eq!(decoded.unaccounted_bytes, 0);

        let (decoded_session, messages) = &mut decoded.per_session[0];
        assert!(Arc::ptr_eq(decoded_session, &session));
        assert_eq!(messages.len(), 4);

        let ranges: Vec<(i64, i64)> = messages
            .iter()
            .map(|m| (m.commit_range().start(), m.commit_range().end()))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (prev + 1, prev + 2),
                (prev + 2, prev + 3),
                (prev + 3, prev + 11),
                (prev + 11, prev + 21),
            ]
        );

        let bodies: Vec<Vec<u8>> = messages
            .iter_mut()
            .map(|m| read_all(m).unwrap())
            .collect();
        assert_eq!(
            bodies,
            vec![b"123".to_vec(), b"4567".to_vec(), b"098".to_vec(), b"0987".to_vec()]
        );

        // Second read of a single-pass body yields nothing further.
        assert_eq!(read_all(&mut messages[0]).unwrap(), Vec::<u8>::new());

        assert_eq!(messages[0].producer_id, "1");
        assert_eq!(messages[2].producer_id, "2");
        assert_eq!(messages[0].write_session_meta.get("a").unwrap(), "b");
        assert_eq!(messages[0].written_at, test_time(5));
        assert_eq!(messages[3].raw_data_len(), gzip(b"0987").len());

        let account_total: i64 = messages.iter().map(|m| m.buffer_bytes_account).sum();
        assert_eq!(account_total, 100);

        assert_eq!(session.last_received_offset(), prev + 20);
    }

    #[test]
    fn unknown_codec_fails_only_that_body() {
        let (registry, _session) = registry_with_session(1, 0);
        let resp = proto::ReadResponse {
            bytes_size: 10,
            partition_data: vec![proto::PartitionData {
                partition_session_id: 1,
                batches: vec![
                    proto::RawBatch {
                        codec: Codec::Unsupported(99),
                        message_data: vec![proto::MessageData {
                            offset: 0,
                            data: Bytes::from_static(b"xx"),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                    proto::RawBatch {
                        codec: Codec::Raw,
                        message_data: vec![proto::MessageData {
                            offset: 1,
                            data: Bytes::from_static(b"ok"),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                ],
            }],
        };

        let mut decoded = decode_read_response(resp, &registry).unwrap();
        let (_, messages) = &mut decoded.per_session[0];
        let err = read_all(&mut messages[0]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        assert_eq!(read_all(&mut messages[1]).unwrap(), b"ok".to_vec());
    }

    #[test]
    fn unknown_session_is_an_error() {
        let registry = SessionRegistry::default();
        let resp = proto::ReadResponse {
            bytes_size: 1,
            partition_data: vec![proto::PartitionData {
                partition_session_id: 42,
                batches: vec![],
            }],
        };
        assert!(matches!(
            decode_read_response(resp, &registry),
            Err(crate::Error::UnknownSession(42))
        ));
    }

    #[test]
    fn frame_without_messages_stays_unaccounted() {
        let (registry, _session) = registry_with_session(1, 0);
        let resp = proto::ReadResponse {
            bytes_size: 512,
            partition_data: vec![proto::PartitionData {
                partition_session_id: 1,
                batches: vec![],
            }],
        };
        let decoded = decode_read_response(resp, &registry).unwrap();
        assert!(decoded.per_session.is_empty());
        assert_eq!(decoded.unaccounted_bytes, 512);
    }

    #[test]
    fn empty_bodies_apportion_uniformly() {
        let (registry, _session) = registry_with_session(1, 0);
        let resp = proto::ReadResponse {
            bytes_size: 10,
            partition_data: vec![proto::PartitionData {
                partition_session_id: 1,
                batches: vec![proto::RawBatch {
                    codec: Codec::Raw,
                    message_data: vec![
                        proto::MessageData {
                            offset: 0,
                            ..Default::default()
                        },
                        proto::MessageData {
                            offset: 1,
                            ..Default::default()
                        },
                        proto::MessageData {
                            offset: 2,
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
            }],
        };
        let decoded = decode_read_response(resp, &registry).unwrap();
        let accounts: Vec<i64> = decoded.per_session[0]
            .1
            .iter()
            .map(|m| m.buffer_bytes_account)
            .collect();
        assert_eq!(accounts.iter().sum::<i64>(), 10);
        // A zero-account message still exists and still counts for reads.
        assert_eq!(accounts, vec![3, 3, 4]);
    }
}
