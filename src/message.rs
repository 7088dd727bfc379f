//! KRPC wire format (BEP-5): bencoded UDP datagrams shaped as
//!
//!     msg['t'] = transaction id (opaque byte string)
//!     msg['y'] in {'q', 'r', 'e'}
//!
//! Queries additionally carry `msg['q']` (the method name) and `msg['a']` (its arguments).
//! Responses carry `msg['r']`; errors carry `msg['e']` as `[code, message]`.
//!
//! ::ping                                    ::find_node
//!   a = {id}                                  a = {id, target}
//!   r = {id}                                  r = {id, nodes}
//!
//! ::get_peers                               ::announce_peer
//!   a = {id, info_hash}                       a = {id, info_hash, port, token, implied_port?}
//!   r = {id, token, values | nodes}           r = {id}
//!
//! `nodes` is a blob of 26-byte compact node entries (20-byte id ++ 4-byte IPv4 ++ 2-byte port,
//! all big-endian); `values` is a list of 6-byte compact peer strings (4-byte IPv4 ++ 2-byte
//! port). Encode/decode goes through `bendy`'s `serde` support, matching this crate's existing
//! BitTorrent-wire-format usage (`bendy::serde::ser`/`de`).

use crate::common::*;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KrpcError(pub i64, pub String);

impl KrpcError {
  pub fn bad_token() -> Self {
    KrpcError(ERROR_PROTOCOL, "Bad Token".to_string())
  }

  pub fn method_unknown() -> Self {
    KrpcError(ERROR_METHOD_UNKNOWN, "Method Unknown".to_string())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
pub enum Query {
  #[serde(rename = "ping")]
  Ping { id: NodeId },

  #[serde(rename = "find_node")]
  FindNode { id: NodeId, target: NodeId },

  #[serde(rename = "get_peers")]
  GetPeers {
    id: NodeId,
    info_hash: NodeId,
  },

  #[serde(rename = "announce_peer")]
  AnnouncePeer {
    id: NodeId,
    info_hash: NodeId,
    port: u16,
    token: serde_bytes::ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    implied_port: Option<u8>,
  },

  /// Never produced by the derived (de)serialization above — `decode` synthesizes this directly
  /// from the raw `q` string when the tagged enum fails to match any known method, so that an
  /// unrecognized query still reaches `handle_query` instead of being dropped as malformed
  /// (§4.8 "Unknown q -> error 204").
  #[serde(skip)]
  Unknown { method: String },
}

impl Query {
  /// The `a.id` of the querying node, if known. Absent for `Unknown`, since its arguments were
  /// never parsed.
  pub fn querier_id(&self) -> Option<NodeId> {
    match self {
      Query::Ping { id } => Some(*id),
      Query::FindNode { id, .. } => Some(*id),
      Query::GetPeers { id, .. } => Some(*id),
      Query::AnnouncePeer { id, .. } => Some(*id),
      Query::Unknown { .. } => None,
    }
  }
}

/// The union of every field a `r` (success response) dict may carry. Which fields are present
/// depends on which query it answers; unused fields are simply absent on the wire
/// (`skip_serializing_if`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFields {
  pub id: NodeId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token: Option<serde_bytes::ByteBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub nodes: Option<serde_bytes::ByteBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub values: Option<Vec<serde_bytes::ByteBuf>>,
}

impl ResponseFields {
  pub fn just_id(id: NodeId) -> Self {
    ResponseFields {
      id,
      token: None,
      nodes: None,
      values: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "y")]
pub enum Body {
  #[serde(rename = "q")]
  Query {
    #[serde(flatten)]
    query: Query,
  },
  #[serde(rename = "r")]
  Response { r: ResponseFields },
  #[serde(rename = "e")]
  Error { e: KrpcError },
}

/// A complete KRPC datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
  #[serde(rename = "t", with = "serde_bytes")]
  pub transaction_id: Vec<u8>,
  #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
  pub version: Option<serde_bytes::ByteBuf>,
  #[serde(flatten)]
  pub body: Body,
}

impl Message {
  pub fn query(tid: Vec<u8>, version: Option<Vec<u8>>, query: Query) -> Self {
    Message {
      transaction_id: tid,
      version: version.map(serde_bytes::ByteBuf::from),
      body: Body::Query { query },
    }
  }

  pub fn response(tid: Vec<u8>, version: Option<Vec<u8>>, r: ResponseFields) -> Self {
    Message {
      transaction_id: tid,
      version: version.map(serde_bytes::ByteBuf::from),
      body: Body::Response { r },
    }
  }

  pub fn error(tid: Vec<u8>, version: Option<Vec<u8>>, e: KrpcError) -> Self {
    Message {
      transaction_id: tid,
      version: version.map(serde_bytes::ByteBuf::from),
      body: Body::Error { e },
    }
  }
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
  bendy::serde::ser::to_bytes(message).context(error::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
  match bendy::serde::de::from_bytes::<Message>(bytes) {
    Ok(message) => Ok(message),
    Err(source) => match decode_unknown_query(bytes) {
      Some(message) => Ok(message),
      None => Err(source).context(error::Decode),
    },
  }
}

/// Just enough of the envelope to recognize an otherwise-unparseable query: its transaction id,
/// version string, and `q` method name, ignoring `a` and anything else. Called only when the
/// full typed decode above already failed, so a query naming a method we don't implement doesn't
/// fail decoding entirely and instead reaches `handle_query`'s `Unknown` arm (§4.8).
#[derive(Debug, Deserialize)]
struct RawQueryEnvelope {
  #[serde(rename = "t", with = "serde_bytes")]
  transaction_id: Vec<u8>,
  #[serde(rename = "v", default)]
  version: Option<serde_bytes::ByteBuf>,
  #[serde(rename = "y")]
  y: String,
  #[serde(rename = "q", default)]
  q: Option<String>,
}

fn decode_unknown_query(bytes: &[u8]) -> Option<Message> {
  let raw: RawQueryEnvelope = bendy::serde::de::from_bytes(bytes).ok()?;
  if raw.y != "q" {
    return None;
  }
  let method = raw.q?;
  Some(Message {
    transaction_id: raw.transaction_id,
    version: raw.version,
    body: Body::Query {
      query: Query::Unknown { method },
    },
  })
}

const COMPACT_NODE_LEN: usize = 26;
const COMPACT_PEER_LEN: usize = 6;

/// Pack contacts as BEP-5 compact node info: 20-byte id ++ 4-byte IPv4 ++ 2-byte port, repeated.
pub fn encode_compact_nodes<'a>(contacts: impl Iterator<Item = &'a Contact>) -> Vec<u8> {
  let mut buf = Vec::new();
  for contact in contacts {
    buf.extend_from_slice(contact.id.as_bytes());
    buf.extend_from_slice(&contact.addr.ip().octets());
    buf.extend_from_slice(&contact.addr.port().to_be_bytes());
  }
  buf
}

/// Unpack BEP-5 compact node info. A trailing partial entry (not a multiple of 26 bytes) is
/// dropped rather than erroring — §4.8's iterative lookup treats the engine's job as "validate
/// length and format" per entry, not reject the whole response for one bad tail.
pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddrV4)> {
  bytes
    .chunks_exact(COMPACT_NODE_LEN)
    .map(|chunk| {
      let mut id = [0u8; 20];
      id.copy_from_slice(&chunk[0..20]);
      let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
      let port = u16::from_be_bytes([chunk[24], chunk[25]]);
      (NodeId::from_bytes(id), SocketAddrV4::new(ip, port))
    })
    .collect()
}

pub fn encode_compact_peer(addr: SocketAddrV4) -> serde_bytes::ByteBuf {
  let mut buf = [0u8; COMPACT_PEER_LEN];
  buf[0..4].copy_from_slice(&addr.ip().octets());
  buf[4..6].copy_from_slice(&addr.port().to_be_bytes());
  serde_bytes::ByteBuf::from(buf.to_vec())
}

pub fn decode_compact_peer(bytes: &[u8]) -> Option<SocketAddrV4> {
  if bytes.len() != COMPACT_PEER_LEN {
    return None;
  }
  let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
  let port = u16::from_be_bytes([bytes[4], bytes[5]]);
  Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
  use super::*;

  use assert_matches::assert_matches;
  use pretty_assertions::assert_eq;

  fn id(byte0: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = byte0;
    NodeId::from_bytes(bytes)
  }

  #[test]
  fn ping_query_round_trips() {
    let msg = Message::query(vec![1, 2], None, Query::Ping { id: id(1) });
    let bytes = encode(&msg).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded.transaction_id, vec![1, 2]);
    assert_matches!(decoded.body, Body::Query { query: Query::Ping { id: got } } if got == id(1));
  }

  #[test]
  fn announce_peer_round_trips_with_implied_port() {
    let msg = Message::query(
      vec![9],
      None,
      Query::AnnouncePeer {
        id: id(1),
        info_hash: id(2),
        port: 6881,
        token: serde_bytes::ByteBuf::from(vec![7, 7, 7]),
        implied_port: Some(1),
      },
    );
    let bytes = encode(&msg).unwrap();
    let decoded = decode(&bytes).unwrap();
    match decoded.body {
      Body::Query {
        query: Query::AnnouncePeer { implied_port, token, .. },
      } => {
        assert_eq!(implied_port, Some(1));
        assert_eq!(token.into_vec(), vec![7, 7, 7]);
      }
      other => panic!("expected announce_peer query, got {:?}", other),
    }
  }

  #[test]
  fn error_round_trips() {
    let msg = Message::error(vec![1], None, KrpcError::bad_token());
    let bytes = encode(&msg).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert_matches!(decoded.body, Body::Error { e } if e == KrpcError::bad_token());
  }

  #[test]
  fn compact_nodes_round_trip() {
    let contacts = vec![
      Contact::new(id(1), "1.2.3.4:6881".parse().unwrap(), Instant::now()),
      Contact::new(id(2), "5.6.7.8:6882".parse().unwrap(), Instant::now()),
    ];
    let bytes = encode_compact_nodes(contacts.iter());
    assert_eq!(bytes.len(), COMPACT_NODE_LEN * 2);
    let decoded = decode_compact_nodes(&bytes);
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].0, id(1));
    assert_eq!(decoded[0].1, "1.2.3.4:6881".parse::<SocketAddrV4>().unwrap());
    assert_eq!(decoded[1].1, "5.6.7.8:6882".parse::<SocketAddrV4>().unwrap());
  }

  #[test]
  fn compact_peer_round_trip() {
    let addr: SocketAddrV4 = "9.9.9.9:1234".parse().unwrap();
    let packed = encode_compact_peer(addr);
    assert_eq!(decode_compact_peer(&packed), Some(addr));
  }

  #[test]
  fn unknown_query_method_decodes_to_unknown_variant() {
    let msg = Message::query(vec![5], None, Query::Ping { id: id(1) });
    let bytes = encode(&msg).unwrap();
    // Swap the method name for one this crate doesn't implement, bencode length-prefix included.
    let needle = b"4:ping".to_vec();
    let pos = bytes
      .windows(needle.len())
      .position(|w| w == needle.as_slice())
      .unwrap();
    let mut patched = bytes[..pos].to_vec();
    patched.extend_from_slice(b"7:explode");
    patched.extend_from_slice(&bytes[pos + needle.len()..]);

    let decoded = decode(&patched).unwrap();
    assert_matches!(
      decoded.body,
      Body::Query { query: Query::Unknown { method } } if method == "explode"
    );
  }

  #[test]
  fn truncated_compact_node_tail_is_dropped() {
    let mut bytes = encode_compact_nodes(std::iter::once(&Contact::new(
      id(1),
      "1.2.3.4:6881".parse().unwrap(),
      Instant::now(),
    )));
    bytes.extend_from_slice(&[1, 2, 3]);
    assert_eq!(decode_compact_nodes(&bytes).len(), 1);
  }
}
