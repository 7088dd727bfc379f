use crate::common::*;

struct PeerRecord {
  addr: SocketAddrV4,
  expires_at: Instant,
}

struct InfohashEntry {
  records: Vec<PeerRecord>,
  last_announced: Instant,
}

/// Events the peer store emits as side effects of `add` and TTL expiry (§4.4, §5 ordering:
/// `peer:new` always precedes any later `peer:delete` for the same `(infohash, addr)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStoreEvent {
  New(NodeId, SocketAddrV4),
  Delete(NodeId, SocketAddrV4),
}

/// `infohash -> peers announcing it`, with TTL expiry and an optional cap on the number of
/// distinct infohashes tracked (§4.4).
pub struct PeerStore {
  ttl: Duration,
  capacity: Option<usize>,
  entries: HashMap<NodeId, InfohashEntry>,
}

impl PeerStore {
  pub fn new(ttl: Duration, capacity: Option<usize>) -> Self {
    PeerStore {
      ttl,
      capacity,
      entries: HashMap::new(),
    }
  }

  /// §4.4 `add`: renews TTL on a duplicate `(infohash, addr)`, else appends a new record,
  /// possibly evicting the least-recently-announced infohash first to stay under capacity.
  /// Returns every `PeerStoreEvent` this call caused: the evicted infohash's `Delete`s (if any,
  /// always first) followed by a `New` if `(info_hash, addr)` wasn't already tracked.
  pub fn add(&mut self, info_hash: NodeId, addr: SocketAddrV4, now: Instant) -> Vec<PeerStoreEvent> {
    let is_new_infohash = !self.entries.contains_key(&info_hash);
    let mut events = if is_new_infohash {
      self.evict_for_capacity(now)
    } else {
      Vec::new()
    };

    let entry = self.entries.entry(info_hash).or_insert_with(|| InfohashEntry {
      records: Vec::new(),
      last_announced: now,
    });
    entry.last_announced = now;

    if let Some(record) = entry.records.iter_mut().find(|r| r.addr == addr) {
      record.expires_at = now + self.ttl;
    } else {
      entry.records.push(PeerRecord {
        addr,
        expires_at: now + self.ttl,
      });
      events.push(PeerStoreEvent::New(info_hash, addr));
    }

    events
  }

  pub fn get(&self, info_hash: &NodeId) -> Vec<SocketAddrV4> {
    self
      .entries
      .get(info_hash)
      .map(|entry| entry.records.iter().map(|r| r.addr).collect())
      .unwrap_or_default()
  }

  pub fn is_empty_for(&self, info_hash: &NodeId) -> bool {
    self
      .entries
      .get(info_hash)
      .map(|entry| entry.records.is_empty())
      .unwrap_or(true)
  }

  /// Drop expired records across every infohash, returning a `Delete` event per expired peer.
  pub fn expire(&mut self, now: Instant) -> Vec<PeerStoreEvent> {
    let mut events = Vec::new();
    self.entries.retain(|info_hash, entry| {
      let (keep, expired): (Vec<_>, Vec<_>) =
        entry.records.drain(..).partition(|r| r.expires_at > now);
      entry.records = keep;
      for r in expired {
        events.push(PeerStoreEvent::Delete(*info_hash, r.addr));
      }
      !entry.records.is_empty()
    });
    events
  }

  /// If an infohash cap is set and adding a new infohash would exceed it, evict the
  /// least-recently-announced infohash, returning a `Delete` for each of its peers.
  fn evict_for_capacity(&mut self, _now: Instant) -> Vec<PeerStoreEvent> {
    let mut events = Vec::new();
    let capacity = match self.capacity {
      Some(c) => c,
      None => return events,
    };
    while self.entries.len() >= capacity {
      let oldest = self
        .entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_announced)
        .map(|(id, _)| *id);
      match oldest {
        Some(id) => {
          if let Some(entry) = self.entries.remove(&id) {
            for record in entry.records {
              events.push(PeerStoreEvent::Delete(id, record.addr));
            }
          }
        }
        None => break,
      }
    }
    events
  }
}
