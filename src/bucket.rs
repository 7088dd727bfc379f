use crate::common::*;

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
  Inserted,
  Rejected,
  NeedSplit,
}

/// A fixed-capacity contact holder for the id range `[lo, hi]` (§4.6).
#[derive(Debug)]
pub struct Bucket {
  pub lo: NodeId,
  pub hi: NodeId,
  pub contacts: BTreeMap<NodeId, Contact>,
  /// Only the home bucket (the one containing the local node id) is splittable.
  pub splittable: bool,
  pub refresh_timer: Option<TimerId>,
}

impl Bucket {
  pub fn new(lo: NodeId, hi: NodeId, splittable: bool) -> Self {
    Bucket {
      lo,
      hi,
      contacts: BTreeMap::new(),
      splittable,
      refresh_timer: None,
    }
  }

  pub fn contains(&self, id: &NodeId) -> bool {
    id.contains_range(&self.lo, &self.hi)
  }

  /// §4.6 insert algorithm.
  pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
    debug_assert!(self.contains(&contact.id));

    if let Some(existing) = self.contacts.get_mut(&contact.id) {
      existing.refresh_last_seen(contact.last_seen);
      return InsertOutcome::Inserted;
    }

    if self.contacts.len() < K {
      self.contacts.insert(contact.id, contact);
      return InsertOutcome::Inserted;
    }

    let evictable = self
      .contacts
      .values()
      .filter(|c| c.health() == Health::Bad)
      .min_by_key(|c| c.last_seen)
      .map(|c| c.id);

    if let Some(evict_id) = evictable {
      self.contacts.remove(&evict_id);
      self.contacts.insert(contact.id, contact);
      return InsertOutcome::Inserted;
    }

    if self.splittable {
      InsertOutcome::NeedSplit
    } else {
      InsertOutcome::Rejected
    }
  }

  pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
    self.contacts.remove(id)
  }

  /// Split this bucket's range at its midpoint, redistributing contacts by membership.
  /// `home` decides which (if either) child remains splittable.
  pub fn split(&mut self, home: &NodeId) -> (Bucket, Bucket) {
    let (hi_left, lo_right) = NodeId::midpoint(&self.lo, &self.hi);

    let mut left = Bucket::new(self.lo, hi_left, false);
    let mut right = Bucket::new(lo_right, self.hi, false);

    for (_, contact) in std::mem::take(&mut self.contacts) {
      if left.contains(&contact.id) {
        left.contacts.insert(contact.id, contact);
      } else {
        right.contacts.insert(contact.id, contact);
      }
    }

    left.splittable = left.contains(home);
    right.splittable = right.contains(home);

    // `left` keeps `self.lo`, so it's the same bucket a refresh timer keyed on `bucket_lo` would
    // find; `right` is new and starts with no timer of its own.
    left.refresh_timer = self.refresh_timer.take();

    (left, right)
  }

  /// A uniformly random target within this bucket's range, for a refresh `find_node` (§4.6).
  pub fn random_target(&self, rng: &mut impl Rng) -> NodeId {
    NodeId::random_in_range(&self.lo, &self.hi, rng)
  }

  pub fn len(&self) -> usize {
    self.contacts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.contacts.is_empty()
  }

  /// Drop this bucket's and every contained contact's timer handle (§5 close semantics). The
  /// timers they named are cancelled wholesale by the caller; this just clears the now-stale
  /// handles.
  pub fn close(&mut self) {
    self.refresh_timer = None;
    for contact in self.contacts.values_mut() {
      contact.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn full_bucket(splittable: bool) -> Bucket {
    let mut b = Bucket::new(NodeId::ZERO, NodeId::MAX, splittable);
    for i in 0..K {
      let mut id = [0u8; 20];
      id[19] = i as u8;
      b.insert(Contact::new(
        NodeId::from_bytes(id),
        format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
        Instant::now(),
      ));
    }
    b
  }

  #[test]
  fn inserts_until_capacity() {
    let b = full_bucket(true);
    assert_eq!(b.len(), K);
  }

  #[test]
  fn duplicate_insert_refreshes_last_seen_only() {
    let mut b = full_bucket(true);
    let id = *b.contacts.keys().next().unwrap();
    let later = Instant::now() + Duration::from_secs(5);
    let outcome = b.insert(Contact::new(id, "127.0.0.1:9999".parse().unwrap(), later));
    assert_eq!(outcome, InsertOutcome::Inserted);
    assert_eq!(b.len(), K);
    assert_eq!(b.contacts[&id].last_seen, later);
    // addr of the existing contact is untouched by a duplicate id observation.
    assert_eq!(b.contacts[&id].addr.port(), 7000);
  }

  #[test]
  fn full_and_all_good_non_home_bucket_rejects() {
    let mut b = full_bucket(false);
    let mut id = [0u8; 20];
    id[19] = 200;
    let outcome = b.insert(Contact::new(
      NodeId::from_bytes(id),
      "127.0.0.1:8000".parse().unwrap(),
      Instant::now(),
    ));
    assert_eq!(outcome, InsertOutcome::Rejected);
    assert_eq!(b.len(), K);
  }

  #[test]
  fn full_and_all_good_home_bucket_needs_split() {
    let mut b = full_bucket(true);
    let mut id = [0u8; 20];
    id[19] = 200;
    let outcome = b.insert(Contact::new(
      NodeId::from_bytes(id),
      "127.0.0.1:8000".parse().unwrap(),
      Instant::now(),
    ));
    assert_eq!(outcome, InsertOutcome::NeedSplit);
  }

  #[test]
  fn full_with_a_bad_contact_evicts_oldest_bad() {
    let mut b = full_bucket(true);
    let ids: Vec<NodeId> = b.contacts.keys().copied().collect();
    for id in &ids[0..2] {
      let c = b.contacts.get_mut(id).unwrap();
      c.curse();
      c.curse();
      c.curse();
    }
    let mut id = [0u8; 20];
    id[19] = 200;
    let outcome = b.insert(Contact::new(
      NodeId::from_bytes(id),
      "127.0.0.1:8000".parse().unwrap(),
      Instant::now(),
    ));
    assert_eq!(outcome, InsertOutcome::Inserted);
    assert_eq!(b.len(), K);
    assert!(!b.contacts.contains_key(&ids[0]));
  }

  #[test]
  fn split_redistributes_by_range() {
    let mut b = Bucket::new(NodeId::ZERO, NodeId::MAX, true);
    let mut low_id = [0u8; 20];
    low_id[0] = 0x10;
    let mut high_id = [0u8; 20];
    high_id[0] = 0xf0;
    b.insert(Contact::new(
      NodeId::from_bytes(low_id),
      "127.0.0.1:7001".parse().unwrap(),
      Instant::now(),
    ));
    b.insert(Contact::new(
      NodeId::from_bytes(high_id),
      "127.0.0.1:7002".parse().unwrap(),
      Instant::now(),
    ));

    let home = NodeId::from_bytes(low_id);
    let (left, right) = b.split(&home);

    assert!(left.contains(&NodeId::from_bytes(low_id)));
    assert!(right.contains(&NodeId::from_bytes(high_id)));
    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert!(left.splittable);
    assert!(!right.splittable);
  }
}
