//! KRPC message construction and parsing: BEP 5 queries/responses plus the
//! BEP 51 `sample_infohashes` extension, and the compact wire formats they
//! share.

use crate::bencode::{self, Value};
use crate::contact::Endpoint;
use crate::error::ProtocolError;
use crate::node::{NodeId, ID_LEN};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

pub const ERR_GENERIC: i64 = 201;
pub const ERR_SERVER: i64 = 202;
pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_METHOD_UNKNOWN: i64 = 204;

/// A contact in the 26-byte compact node format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

/// Packs contacts into the concatenated 26-byte-per-entry compact format.
pub fn pack_nodes(nodes: &[CompactNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for n in nodes {
        out.extend_from_slice(n.id.as_bytes());
        out.extend_from_slice(&n.endpoint.ip().octets());
        out.extend_from_slice(&n.endpoint.port().to_be_bytes());
    }
    out
}

/// Unpacks the compact node format. Errors if the length isn't a multiple
/// of 26 bytes.
pub fn unpack_nodes(bytes: &[u8]) -> Result<Vec<CompactNode>, ProtocolError> {
    if bytes.len() % 26 != 0 {
        return Err(ProtocolError::BadLength {
            field: "nodes",
            expected_multiple_of: 26,
            got: bytes.len(),
        });
    }
    let mut out = Vec::with_capacity(bytes.len() / 26);
    for chunk in bytes.chunks_exact(26) {
        let mut id_buf = [0u8; ID_LEN];
        id_buf.copy_from_slice(&chunk[0..20]);
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        let endpoint = Endpoint::new(ip, port).ok_or(ProtocolError::BadField {
            field: "nodes",
            reason: "zero port in compact node entry",
        })?;
        out.push(CompactNode {
            id: NodeId::from_bytes(id_buf),
            endpoint,
        });
    }
    Ok(out)
}

/// Packs a single peer into the 6-byte compact peer format.
pub fn pack_peer(endpoint: &Endpoint) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0..4].copy_from_slice(&endpoint.ip().octets());
    out[4..6].copy_from_slice(&endpoint.port().to_be_bytes());
    out
}

/// Unpacks a single 6-byte compact peer entry.
pub fn unpack_peer(bytes: &[u8]) -> Result<Endpoint, ProtocolError> {
    if bytes.len() != 6 {
        return Err(ProtocolError::BadLength {
            field: "values[]",
            expected_multiple_of: 6,
            got: bytes.len(),
        });
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Endpoint::new(ip, port).ok_or(ProtocolError::BadField {
        field: "values[]",
        reason: "zero port in compact peer entry",
    })
}

/// Maximum number of BEP 51 samples carried in one message.
pub const MAX_SAMPLES: usize = 20;

/// Packs info_hashes into the concatenated 20-byte BEP 51 sample format,
/// clamping to [`MAX_SAMPLES`] entries.
pub fn pack_samples(hashes: &[NodeId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len().min(MAX_SAMPLES) * ID_LEN);
    for h in hashes.iter().take(MAX_SAMPLES) {
        out.extend_from_slice(h.as_bytes());
    }
    out
}

/// Unpacks the BEP 51 sample format, truncating to [`MAX_SAMPLES`] entries
/// on reception.
pub fn unpack_samples(bytes: &[u8]) -> Result<Vec<NodeId>, ProtocolError> {
    if bytes.len() % ID_LEN != 0 {
        return Err(ProtocolError::BadLength {
            field: "samples",
            expected_multiple_of: ID_LEN,
            got: bytes.len(),
        });
    }
    let mut out = Vec::new();
    for chunk in bytes.chunks_exact(ID_LEN).take(MAX_SAMPLES) {
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(chunk);
        out.push(NodeId::from_bytes(buf));
    }
    Ok(out)
}

/// The query-specific arguments of an inbound `q` message.
#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: NodeId },
    SampleInfohashes { target: NodeId },
    /// A method name we don't implement; carried through so the engine can
    /// reply with error 204 rather than silently dropping it.
    Unknown(String),
}

impl Query {
    fn method_name(&self) -> &str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::SampleInfohashes { .. } => "sample_infohashes",
            Query::Unknown(m) => m.as_str(),
        }
    }
}

/// The return (`r`) fields of a response message. Every field is optional
/// because which ones are present depends on the query that was sent.
#[derive(Debug, Clone, Default)]
pub struct ResponseFields {
    pub nodes: Option<Vec<CompactNode>>,
    pub values: Option<Vec<Endpoint>>,
    pub token: Option<Vec<u8>>,
    pub samples: Option<Vec<NodeId>>,
    pub interval: Option<i64>,
    pub num: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum Message {
    Query {
        tid: Vec<u8>,
        sender_id: NodeId,
        query: Query,
    },
    Response {
        tid: Vec<u8>,
        sender_id: NodeId,
        fields: ResponseFields,
    },
    Error {
        tid: Vec<u8>,
        code: i64,
        text: String,
    },
}

impl Message {
    pub fn tid(&self) -> &[u8] {
        match self {
            Message::Query { tid, .. } => tid,
            Message::Response { tid, .. } => tid,
            Message::Error { tid, .. } => tid,
        }
    }
}

/// A parse failure paired with whatever transaction id was recoverable
/// before the failure happened. `tid` is `None` when the message was
/// malformed before the `t` field could even be read; `is_query` tells the
/// caller whether the failed message was a `q` message, the only case
/// where replying with error 203 makes sense.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub tid: Option<Vec<u8>>,
    pub is_query: bool,
    pub error: ProtocolError,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ParseError {}

fn id_field(args: &Value, field: &'static str) -> Result<NodeId, ProtocolError> {
    let bytes = args
        .get(field.as_bytes())
        .map_err(|_| ProtocolError::BadField {
            field,
            reason: "args is not a dict",
        })?
        .ok_or(ProtocolError::BadField {
            field,
            reason: "missing",
        })?
        .as_bytes()
        .map_err(|_| ProtocolError::BadField {
            field,
            reason: "not a byte string",
        })?;
    NodeId::from_slice(field, bytes).map_err(|_| ProtocolError::BadField {
        field,
        reason: "must be exactly 20 bytes",
    })
}

/// Parses a raw KRPC datagram into a tagged [`Message`].
///
/// A parse failure carries the `t` field back out whenever one could be
/// read, so a caller replying to a malformed query can still echo the
/// sender's transaction id in an error 203.
pub fn parse(buf: &[u8]) -> Result<Message, ParseError> {
    let no_tid = |error: ProtocolError| ParseError {
        tid: None,
        is_query: false,
        error,
    };

    let value = bencode::decode_all(buf)
        .map_err(|_| {
            no_tid(ProtocolError::BadField {
                field: "message",
                reason: "not valid bencode",
            })
        })?;

    let dict_err = || {
        no_tid(ProtocolError::BadField {
            field: "message",
            reason: "top level is not a dict",
        })
    };
    let top = value.as_dict().map_err(|_| dict_err())?;

    let tid = top
        .get(b"t".as_slice())
        .and_then(|v| v.as_bytes().ok())
        .ok_or_else(|| {
            no_tid(ProtocolError::BadField {
                field: "t",
                reason: "missing or not a byte string",
            })
        })?
        .to_vec();

    let y = top
        .get(b"y".as_slice())
        .and_then(|v| v.as_bytes().ok())
        .ok_or_else(|| {
            ParseError {
                tid: Some(tid.clone()),
                is_query: false,
                error: ProtocolError::BadField {
                    field: "y",
                    reason: "missing or not a byte string",
                },
            }
        })?;

    match y {
        b"q" => parse_query(&value, tid.clone()).map_err(|error| ParseError {
            tid: Some(tid),
            is_query: true,
            error,
        }),
        b"r" => parse_response(&value, tid.clone()).map_err(|error| ParseError {
            tid: Some(tid),
            is_query: false,
            error,
        }),
        b"e" => parse_error(&value, tid.clone()).map_err(|error| ParseError {
            tid: Some(tid),
            is_query: false,
            error,
        }),
        _ => Err(ParseError {
            tid: Some(tid),
            is_query: false,
            error: ProtocolError::BadField {
                field: "y",
                reason: "must be q, r, or e",
            },
        }),
    }
}

fn parse_query(value: &Value, tid: Vec<u8>) -> Result<Message, ProtocolError> {
    let top = value.as_dict().unwrap();
    let method = top
        .get(b"q".as_slice())
        .and_then(|v| v.as_bytes().ok())
        .ok_or(ProtocolError::BadField {
            field: "q",
            reason: "missing or not a byte string",
        })?;
    let args = top.get(b"a".as_slice()).ok_or(ProtocolError::BadField {
        field: "a",
        reason: "missing",
    })?;

    let sender_id = id_field(args, "id")?;

    let query = match method {
        b"ping" => Query::Ping,
        b"find_node" => Query::FindNode {
            target: id_field(args, "target")?,
        },
        b"get_peers" => Query::GetPeers {
            info_hash: id_field(args, "info_hash")?,
        },
        b"sample_infohashes" => Query::SampleInfohashes {
            target: id_field(args, "target")?,
        },
        other => Query::Unknown(String::from_utf8_lossy(other).into_owned()),
    };

    Ok(Message::Query {
        tid,
        sender_id,
        query,
    })
}

fn parse_response(value: &Value, tid: Vec<u8>) -> Result<Message, ProtocolError> {
    let top = value.as_dict().unwrap();
    let r = top.get(b"r".as_slice()).ok_or(ProtocolError::BadField {
        field: "r",
        reason: "missing",
    })?;

    let sender_id = id_field(r, "id")?;

    let nodes = match r.get(b"nodes".as_slice()).ok().flatten() {
        Some(v) => {
            let bytes = v.as_bytes().map_err(|_| ProtocolError::BadField {
                field: "nodes",
                reason: "not a byte string",
            })?;
            Some(unpack_nodes(bytes)?)
        }
        None => None,
    };

    let values = match r.get(b"values".as_slice()).ok().flatten() {
        Some(v) => {
            let list = v.as_list().map_err(|_| ProtocolError::BadField {
                field: "values",
                reason: "not a list",
            })?;
            let mut endpoints = Vec::with_capacity(list.len());
            for item in list {
                let bytes = item.as_bytes().map_err(|_| ProtocolError::BadField {
                    field: "values[]",
                    reason: "not a byte string",
                })?;
                endpoints.push(unpack_peer(bytes)?);
            }
            Some(endpoints)
        }
        None => None,
    };

    let token = r
        .get(b"token".as_slice())
        .ok()
        .flatten()
        .and_then(|v| v.as_bytes().ok())
        .map(|b| b.to_vec());

    let samples = match r.get(b"samples".as_slice()).ok().flatten() {
        Some(v) => {
            let bytes = v.as_bytes().map_err(|_| ProtocolError::BadField {
                field: "samples",
                reason: "not a byte string",
            })?;
            Some(unpack_samples(bytes)?)
        }
        None => None,
    };

    let interval = r
        .get(b"interval".as_slice())
        .ok()
        .flatten()
        .and_then(|v| v.as_int().ok());
    let num = r
        .get(b"num".as_slice())
        .ok()
        .flatten()
        .and_then(|v| v.as_int().ok());

    Ok(Message::Response {
        tid,
        sender_id,
        fields: ResponseFields {
            nodes,
            values,
            token,
            samples,
            interval,
            num,
        },
    })
}

fn parse_error(value: &Value, tid: Vec<u8>) -> Result<Message, ProtocolError> {
    let top = value.as_dict().unwrap();
    let e = top
        .get(b"e".as_slice())
        .ok_or(ProtocolError::BadField {
            field: "e",
            reason: "missing",
        })?
        .as_list()
        .map_err(|_| ProtocolError::BadField {
            field: "e",
            reason: "not a 2-element list",
        })?;
    if e.len() != 2 {
        return Err(ProtocolError::BadField {
            field: "e",
            reason: "not a 2-element list",
        });
    }
    let code = e[0].as_int().map_err(|_| ProtocolError::BadField {
        field: "e[0]",
        reason: "not an integer",
    })?;
    let text = e[1]
        .as_bytes()
        .map_err(|_| ProtocolError::BadField {
            field: "e[1]",
            reason: "not a byte string",
        })
        .map(|b| String::from_utf8_lossy(b).into_owned())?;
    Ok(Message::Error { tid, code, text })
}

fn dict(pairs: Vec<(&'static [u8], Value)>) -> Value {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
        map.insert(k.to_vec(), v);
    }
    Value::Dict(map)
}

/// Builds the wire bytes for an outbound query.
pub fn build_query(tid: &[u8], sender_id: &NodeId, query: &Query) -> Vec<u8> {
    let mut args = vec![(b"id".as_slice(), Value::bytes(sender_id.as_bytes().to_vec()))];
    match query {
        Query::Ping => {}
        Query::FindNode { target } => {
            args.push((b"target", Value::bytes(target.as_bytes().to_vec())))
        }
        Query::GetPeers { info_hash } => {
            args.push((b"info_hash", Value::bytes(info_hash.as_bytes().to_vec())))
        }
        Query::SampleInfohashes { target } => {
            args.push((b"target", Value::bytes(target.as_bytes().to_vec())))
        }
        Query::Unknown(_) => {}
    }

    let top = dict(vec![
        (b"t", Value::bytes(tid.to_vec())),
        (b"y", Value::bytes(b"q".to_vec())),
        (b"q", Value::bytes(query.method_name().as_bytes().to_vec())),
        (b"a", dict(args)),
    ]);
    bencode::encode(&top)
}

/// Builds the wire bytes for an outbound response.
pub fn build_response(tid: &[u8], sender_id: &NodeId, fields: &ResponseFields) -> Vec<u8> {
    let mut r = vec![(b"id".as_slice(), Value::bytes(sender_id.as_bytes().to_vec()))];
    if let Some(nodes) = &fields.nodes {
        r.push((b"nodes", Value::bytes(pack_nodes(nodes))));
    }
    if let Some(values) = &fields.values {
        let list = values.iter().map(|e| Value::bytes(pack_peer(e).to_vec())).collect();
        r.push((b"values", Value::List(list)));
    }
    if let Some(token) = &fields.token {
        r.push((b"token", Value::bytes(token.clone())));
    }
    if let Some(samples) = &fields.samples {
        r.push((b"samples", Value::bytes(pack_samples(samples))));
    }
    if let Some(interval) = fields.interval {
        r.push((b"interval", Value::Int(interval)));
    }
    if let Some(num) = fields.num {
        r.push((b"num", Value::Int(num)));
    }

    let top = dict(vec![
        (b"t", Value::bytes(tid.to_vec())),
        (b"y", Value::bytes(b"r".to_vec())),
        (b"r", dict(r)),
    ]);
    bencode::encode(&top)
}

/// Builds the wire bytes for an outbound error message.
pub fn build_error(tid: &[u8], code: i64, message: &str) -> Vec<u8> {
    let top = dict(vec![
        (b"t", Value::bytes(tid.to_vec())),
        (b"y", Value::bytes(b"e".to_vec())),
        (
            b"e",
            Value::List(vec![Value::Int(code), Value::bytes(message.as_bytes().to_vec())]),
        ),
    ]);
    bencode::encode(&top)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; ID_LEN])
    }

    #[test]
    fn compact_node_round_trip() {
        let node = CompactNode {
            id: id(b'A'),
            endpoint: Endpoint::new(Ipv4Addr::new(192, 168, 1, 1), 6881).unwrap(),
        };
        let packed = pack_nodes(&[node]);
        assert_eq!(packed.len(), 26);
        assert_eq!(
            packed,
            [b'A'; 20]
                .iter()
                .chain([0xc0, 0xa8, 0x01, 0x01, 0x1a, 0xe1].iter())
                .copied()
                .collect::<Vec<u8>>()
        );
        let unpacked = unpack_nodes(&packed).unwrap();
        assert_eq!(unpacked, vec![node]);
    }

    #[test]
    fn compact_nodes_bad_length_is_rejected() {
        assert!(unpack_nodes(&[0u8; 25]).is_err());
    }

    #[test]
    fn samples_clamp_on_emission_and_truncate_on_reception() {
        let hashes: Vec<NodeId> = (0u8..50).map(id).collect();
        let packed = pack_samples(&hashes);
        assert_eq!(packed.len(), MAX_SAMPLES * ID_LEN);

        // A hostile/buggy peer sending more than 20 concatenated hashes
        // should have reception truncate rather than error.
        let mut oversized = packed.clone();
        oversized.extend_from_slice(id(200).as_bytes());
        let unpacked = unpack_samples(&oversized).unwrap();
        assert_eq!(unpacked.len(), MAX_SAMPLES);
    }

    #[test]
    fn ping_query_wire_format_is_literal() {
        let sender = id(b'A');
        let bytes = build_query(b"aa", &sender, &Query::Ping);
        assert_eq!(
            bytes,
            b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn ping_response_wire_format_is_literal() {
        let responder = id(b'B');
        let fields = ResponseFields {
            nodes: None,
            values: None,
            token: None,
            samples: None,
            interval: None,
            num: None,
        };
        let bytes = build_response(b"aa", &responder, &fields);
        assert_eq!(
            bytes,
            b"d1:rd2:id20:BBBBBBBBBBBBBBBBBBBBe1:t2:aa1:y1:re".to_vec()
        );
    }

    #[test]
    fn parse_ping_query_round_trips() {
        let sender = id(b'A');
        let bytes = build_query(b"aa", &sender, &Query::Ping);
        let msg = parse(&bytes).unwrap();
        match msg {
            Message::Query { tid, sender_id, query } => {
                assert_eq!(tid, b"aa");
                assert_eq!(sender_id, sender);
                assert!(matches!(query, Query::Ping));
            }
            _ => panic!("expected a query"),
        }
    }

    #[test]
    fn unknown_method_parses_as_unknown_query() {
        let raw = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q7:unknown1:t2:aa1:y1:qe";
        let msg = parse(raw).unwrap();
        match msg {
            Message::Query { query: Query::Unknown(name), .. } => assert_eq!(name, "unknown"),
            _ => panic!("expected unknown query"),
        }
    }

    #[test]
    fn get_peers_response_with_oversized_nodes_field_is_a_parse_error() {
        // 25 bytes instead of a multiple of 26.
        let raw_nodes = vec![0u8; 25];
        let top = dict(vec![
            (b"t", Value::bytes(b"aa".to_vec())),
            (b"y", Value::bytes(b"r".to_vec())),
            (
                b"r",
                dict(vec![
                    (b"id", Value::bytes([b'B'; 20].to_vec())),
                    (b"nodes", Value::bytes(raw_nodes)),
                ]),
            ),
        ]);
        let bytes = bencode::encode(&top);
        let err = parse(&bytes).unwrap_err();
        assert_eq!(err.tid, Some(b"aa".to_vec()));
        assert!(!err.is_query, "a malformed response is not a malformed request");
    }

    #[test]
    fn malformed_query_parse_error_carries_the_tid_for_an_error_203_reply() {
        // get_peers with a truncated info_hash (19 bytes instead of 20).
        let top = dict(vec![
            (b"t", Value::bytes(b"zz".to_vec())),
            (b"y", Value::bytes(b"q".to_vec())),
            (b"q", Value::bytes(b"get_peers".to_vec())),
            (
                b"a",
                dict(vec![
                    (b"id", Value::bytes([b'A'; 20].to_vec())),
                    (b"info_hash", Value::bytes(vec![0u8; 19])),
                ]),
            ),
        ]);
        let bytes = bencode::encode(&top);
        let err = parse(&bytes).unwrap_err();
        assert_eq!(err.tid, Some(b"zz".to_vec()));
        assert!(err.is_query);
    }

    #[test]
    fn invalid_bencode_parse_error_has_no_recoverable_tid() {
        let err = parse(b"not bencode at all").unwrap_err();
        assert_eq!(err.tid, None);
        assert!(!err.is_query);
    }

    #[test]
    fn error_message_round_trips() {
        let bytes = build_error(b"aa", ERR_METHOD_UNKNOWN, "method unknown");
        let msg = parse(&bytes).unwrap();
        match msg {
            Message::Error { tid, code, text } => {
                assert_eq!(tid, b"aa");
                assert_eq!(code, ERR_METHOD_UNKNOWN);
                assert_eq!(text, "method unknown");
            }
            _ => panic!("expected an error message"),
        }
    }
}
