use crate::common::*;

/// Liveness classification of a remote node, derived purely from `bad_count` (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Health {
  Good,
  Questionable,
  Bad,
}

/// A remote node as tracked by exactly one k-bucket.
///
/// Invariants (§3): `good == (bad_count <= 2)`; `last_seen` is monotonically non-decreasing;
/// at most one outstanding re-ping timer (`ping_timer`).
#[derive(Clone, Debug)]
pub struct Contact {
  pub id: NodeId,
  pub addr: SocketAddrV4,
  pub first_seen: Instant,
  pub last_seen: Instant,
  pub bad_count: u8,
  pub ping_timer: Option<TimerId>,
}

impl Contact {
  pub fn new(id: NodeId, addr: SocketAddrV4, now: Instant) -> Self {
    Contact {
      id,
      addr,
      first_seen: now,
      last_seen: now,
      bad_count: 0,
      ping_timer: None,
    }
  }

  pub fn health(&self) -> Health {
    match self.bad_count {
      0 => Health::Good,
      1 | 2 => Health::Questionable,
      _ => Health::Bad,
    }
  }

  /// True iff the contact is still routable (§3: `good = bad_count <= 2`).
  pub fn is_good(&self) -> bool {
    self.health() != Health::Bad
  }

  /// Record a successful RPC: resets the failure streak and bumps recency.
  pub fn thank(&mut self, now: Instant) {
    self.bad_count = 0;
    self.last_seen = now;
  }

  /// Record a failed RPC (timeout, transport error, or remote error reply).
  pub fn curse(&mut self) {
    self.bad_count = self.bad_count.saturating_add(1);
  }

  pub fn refresh_last_seen(&mut self, now: Instant) {
    if now > self.last_seen {
      self.last_seen = now;
    }
  }

  /// Drop the now-stale re-ping timer handle (§5 close semantics).
  pub fn close(&mut self) {
    self.ping_timer = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn contact() -> Contact {
    Contact::new(
      NodeId::generate(),
      "127.0.0.1:6881".parse().unwrap(),
      Instant::now(),
    )
  }

  #[test]
  fn starts_good() {
    assert_eq!(contact().health(), Health::Good);
  }

  #[test]
  fn becomes_questionable_then_bad() {
    let mut c = contact();
    c.curse();
    assert_eq!(c.health(), Health::Questionable);
    c.curse();
    assert_eq!(c.health(), Health::Questionable);
    c.curse();
    assert_eq!(c.health(), Health::Bad);
    assert!(!c.is_good());
  }

  #[test]
  fn thank_resets_bad_count() {
    let mut c = contact();
    c.curse();
    c.curse();
    c.curse();
    assert_eq!(c.health(), Health::Bad);
    c.thank(Instant::now());
    assert_eq!(c.health(), Health::Good);
    assert!(c.is_good());
  }
}
