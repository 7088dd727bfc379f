use crate::common::*;

/// A 160-bit Kademlia identifier: a DHT node id or a BitTorrent infohash.
///
/// Equality and ordering are bytewise big-endian, matching the KRPC wire representation: a
/// `NodeId` serializes as a raw 20-byte bencode string, never as a list of integers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 20]);

/// XOR distance between two `NodeId`s. Ordering is the Kademlia metric: smaller is closer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 20]);

impl Distance {
  pub const MAX: Distance = Distance([0xff; 20]);
}

impl NodeId {
  pub const ZERO: NodeId = NodeId([0; 20]);
  pub const MAX: NodeId = NodeId([0xff; 20]);

  pub fn from_bytes(bytes: [u8; 20]) -> Self {
    NodeId(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 20] {
    &self.0
  }

  /// Generate a fresh id from cryptographically random bytes, hashed with SHA-1 per §3.
  pub fn generate() -> Self {
    use sha1::{Digest, Sha1};

    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed);
    let digest = Sha1::digest(&seed);
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest);
    NodeId(id)
  }

  /// A uniformly random id in the closed range `[lo, hi]`, exact over the full 160 bits via
  /// rejection sampling (never a biased modulo).
  pub fn random_in_range(lo: &NodeId, hi: &NodeId, rng: &mut impl Rng) -> NodeId {
    debug_assert!(lo <= hi);
    let span = sub(&hi.0, &lo.0);
    loop {
      let mut candidate = [0u8; 20];
      rng.fill(&mut candidate);
      if cmp_bytes(&candidate, &span) != Ordering::Greater {
        return NodeId(add(&lo.0, &candidate));
      }
    }
  }

  pub fn distance(&self, other: &NodeId) -> Distance {
    let mut out = [0u8; 20];
    for i in 0..20 {
      out[i] = self.0[i] ^ other.0[i];
    }
    Distance(out)
  }

  pub fn contains_range(&self, lo: &NodeId, hi: &NodeId) -> bool {
    lo <= self && self <= hi
  }

  /// Split `[lo, hi]` into `(hi_left, lo_right)` such that `hi_left = floor((lo + hi) / 2)` and
  /// `lo_right = hi_left + 1`, both as exact 160-bit arithmetic (§4.1).
  pub fn midpoint(lo: &NodeId, hi: &NodeId) -> (NodeId, NodeId) {
    const ONE: [u8; 20] = {
      let mut one = [0u8; 20];
      one[19] = 1;
      one
    };
    let sum = add_with_carry(&lo.0, &hi.0);
    let hi_left = shr1(&sum);
    let lo_right = add(&hi_left, &ONE);
    (NodeId(hi_left), NodeId(lo_right))
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Debug for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "NodeId({})", self.to_hex())
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl Serialize for NodeId {
  fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_bytes(&self.0)
  }
}

impl<'de> Deserialize<'de> for NodeId {
  fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
    let bytes: [u8; 20] = bytes
      .into_vec()
      .try_into()
      .map_err(|_| serde::de::Error::custom("node id must be exactly 20 bytes"))?;
    Ok(NodeId(bytes))
  }
}

/// `a <= b` lexicographically.
fn cmp_bytes(a: &[u8; 20], b: &[u8; 20]) -> Ordering {
  a.iter().cmp(b.iter())
}

/// 160-bit addition, discarding any carry out of the top bit (saturating at `2^160 - 1`).
fn add(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
  let mut out = [0u8; 20];
  let mut carry = 0u16;
  for i in (0..20).rev() {
    let sum = a[i] as u16 + b[i] as u16 + carry;
    out[i] = (sum & 0xff) as u8;
    carry = sum >> 8;
  }
  if carry > 0 {
    [0xffu8; 20]
  } else {
    out
  }
}

/// 160-bit addition retaining the 161st carry bit, returned as a 21-byte big-endian array
/// (index 0 holds the carry, 0 or 1).
fn add_with_carry(a: &[u8; 20], b: &[u8; 20]) -> [u8; 21] {
  let mut out = [0u8; 21];
  let mut carry = 0u16;
  for i in (0..20).rev() {
    let sum = a[i] as u16 + b[i] as u16 + carry;
    out[i + 1] = (sum & 0xff) as u8;
    carry = sum >> 8;
  }
  out[0] = carry as u8;
  out
}

/// Right-shift a 21-byte (161-bit) value by one bit, truncating back down to 160 bits.
fn shr1(x: &[u8; 21]) -> [u8; 20] {
  let mut out = [0u8; 20];
  let mut carry = 0u8;
  for i in 0..21 {
    let bit_out = x[i] & 1;
    let shifted = (x[i] >> 1) | (carry << 7);
    if i >= 1 {
      out[i - 1] = shifted;
    }
    carry = bit_out;
  }
  out
}

/// 160-bit subtraction `a - b`, assuming `a >= b`; saturates at zero otherwise.
fn sub(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
  if cmp_bytes(a, b) == Ordering::Less {
    return [0u8; 20];
  }
  let mut out = [0u8; 20];
  let mut borrow = 0i16;
  for i in (0..20).rev() {
    let mut diff = a[i] as i16 - b[i] as i16 - borrow;
    if diff < 0 {
      diff += 256;
      borrow = 1;
    } else {
      borrow = 0;
    }
    out[i] = diff as u8;
  }
  out
}
