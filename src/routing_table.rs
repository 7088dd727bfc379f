use crate::common::*;

/// At most 160 splits over the table's lifetime (§5 resource bounds: 160 buckets x K contacts).
const MAX_SPLITS: usize = 160;

/// An ordered tiling of the 160-bit id space into k-buckets (§4.7).
pub struct RoutingTable {
  local_id: NodeId,
  buckets: Vec<Bucket>,
  split_count: usize,
}

impl RoutingTable {
  pub fn new(local_id: NodeId) -> Self {
    RoutingTable {
      local_id,
      buckets: vec![Bucket::new(NodeId::ZERO, NodeId::MAX, true)],
      split_count: 0,
    }
  }

  pub fn local_id(&self) -> NodeId {
    self.local_id
  }

  pub fn buckets(&self) -> &[Bucket] {
    &self.buckets
  }

  pub fn buckets_mut(&mut self) -> &mut [Bucket] {
    &mut self.buckets
  }

  fn locate_index(&self, id: &NodeId) -> usize {
    self
      .buckets
      .partition_point(|bucket| bucket.hi < *id)
      .min(self.buckets.len() - 1)
  }

  pub fn locate(&self, id: &NodeId) -> &Bucket {
    &self.buckets[self.locate_index(id)]
  }

  /// Find the bucket, if any, whose range currently starts at `lo` — used by timer callbacks
  /// to check whether a scheduled refresh still refers to a live bucket (§9 design note).
  pub fn find_by_lo(&self, lo: &NodeId) -> Option<&Bucket> {
    self.buckets.iter().find(|b| b.lo == *lo)
  }

  pub fn find_by_lo_mut(&mut self, lo: &NodeId) -> Option<&mut Bucket> {
    self.buckets.iter_mut().find(|b| b.lo == *lo)
  }

  /// Find the contact `id` is currently held under, if any.
  pub fn find_contact(&self, id: &NodeId) -> Option<&Contact> {
    self.locate(id).contacts.get(id)
  }

  pub fn find_contact_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
    let idx = self.locate_index(id);
    self.buckets[idx].contacts.get_mut(id)
  }

  /// §4.7 `observe`: insert-or-refresh `id`/`addr`, splitting the home bucket as needed.
  pub fn observe(&mut self, id: NodeId, addr: SocketAddrV4, now: Instant) {
    if id == self.local_id {
      return;
    }

    loop {
      let idx = self.locate_index(&id);
      let is_home = self.buckets[idx].contains(&self.local_id);
      let contact = Contact::new(id, addr, now);

      match self.buckets[idx].insert(contact) {
        InsertOutcome::Inserted | InsertOutcome::Rejected => break,
        // Only the home bucket is ever splittable, so a non-home NeedSplit can't happen in
        // practice; the `is_home` check is defensive, not load-bearing.
        InsertOutcome::NeedSplit if is_home && self.split_count < MAX_SPLITS => {
          let home = self.local_id;
          let (left, right) = self.buckets[idx].split(&home);
          self.buckets.splice(idx..=idx, vec![left, right]);
          self.split_count += 1;
        }
        InsertOutcome::NeedSplit => break,
      }
    }
  }

  /// §4.7 `kClosest`: the `k` good contacts nearest `id` by XOR distance, ascending.
  pub fn k_closest(&self, id: &NodeId, k: usize) -> Vec<Contact> {
    let idx = self.locate_index(id);
    let mut candidates: Vec<Contact> = self.buckets[idx].contacts.values().cloned().collect();

    if candidates.len() < k {
      if idx > 0 {
        candidates.extend(self.buckets[idx - 1].contacts.values().cloned());
      }
      if idx + 1 < self.buckets.len() {
        candidates.extend(self.buckets[idx + 1].contacts.values().cloned());
      }
    }

    candidates.retain(|c| c.is_good());
    candidates.sort_by_key(|c| c.id.distance(id));
    candidates.dedup_by_key(|c| c.id);
    candidates.truncate(k);
    candidates
  }

  pub fn len(&self) -> usize {
    self.buckets.iter().map(Bucket::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Close every bucket, which closes every contact in it (§5 close semantics).
  pub fn close(&mut self) {
    for bucket in &mut self.buckets {
      bucket.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(port: u16) -> SocketAddrV4 {
    format!("127.0.0.1:{}", port).parse().unwrap()
  }

  fn id_with_prefix(byte0: u8, tail: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = byte0;
    bytes[19] = tail;
    NodeId::from_bytes(bytes)
  }

  #[test]
  fn starts_as_single_full_range_home_bucket() {
    let table = RoutingTable::new(NodeId::generate());
    assert_eq!(table.buckets().len(), 1);
    assert_eq!(table.buckets()[0].lo, NodeId::ZERO);
    assert_eq!(table.buckets()[0].hi, NodeId::MAX);
    assert!(table.buckets()[0].splittable);
  }

  #[test]
  fn observe_inserts_new_contact() {
    let mut table = RoutingTable::new(NodeId::generate());
    let id = NodeId::generate();
    table.observe(id, addr(7001), Instant::now());
    assert_eq!(table.len(), 1);
    assert!(table.find_contact(&id).is_some());
  }

  #[test]
  fn repeated_ping_refreshes_without_growing_table() {
    let mut table = RoutingTable::new(NodeId::generate());
    let id = NodeId::generate();
    table.observe(id, addr(7001), Instant::now());
    let later = Instant::now() + Duration::from_secs(1);
    table.observe(id, addr(7001), later);
    assert_eq!(table.len(), 1);
    assert_eq!(table.find_contact(&id).unwrap().last_seen, later);
  }

  #[test]
  fn never_inserts_local_id() {
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local);
    table.observe(local, addr(7001), Instant::now());
    assert!(table.is_empty());
  }

  #[test]
  fn splits_home_bucket_when_full_and_all_good() {
    // local id in the upper half, so the home bucket after a split is the "right" child.
    let local = id_with_prefix(0x80, 0);
    let mut table = RoutingTable::new(local);

    for i in 0..8u8 {
      table.observe(id_with_prefix(0x80, i + 1), addr(7100 + i as u16), Instant::now());
    }
    assert_eq!(table.buckets().len(), 1);
    assert_eq!(table.len(), 8);

    // 9th good contact in the upper half forces exactly one split.
    table.observe(id_with_prefix(0x90, 1), addr(7200), Instant::now());
    assert_eq!(table.buckets().len(), 2);
    assert_eq!(table.len(), 9);

    // further contacts that land in the non-home (lower, non-splittable) child are rejected
    // once it's full rather than causing a second split.
    let non_home_hi = table
      .buckets()
      .iter()
      .find(|b| !b.contains(&local))
      .map(|b| b.hi)
      .unwrap();
    assert!(non_home_hi < local);
  }

  #[test]
  fn k_closest_excludes_bad_and_sorts_by_distance() {
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local);
    let target = NodeId::generate();

    let near = NodeId::from_bytes({
      let mut b = *target.as_bytes();
      b[19] ^= 0x01;
      b
    });
    let far = NodeId::from_bytes({
      let mut b = *target.as_bytes();
      b[0] ^= 0xff;
      b
    });

    table.observe(near, addr(7001), Instant::now());
    table.observe(far, addr(7002), Instant::now());

    let closest = table.k_closest(&target, 8);
    assert_eq!(closest.len(), 2);
    assert_eq!(closest[0].id, near);
    assert_eq!(closest[1].id, far);

    if let Some(c) = table.find_contact_mut(&near) {
      c.curse();
      c.curse();
      c.curse();
    }
    let closest = table.k_closest(&target, 8);
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id, far);
  }
}
