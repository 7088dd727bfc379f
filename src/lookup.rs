//! Iterative Kademlia lookups (§4.8): α-parallel, round-driven. Since the node runs a
//! single-threaded, non-blocking event loop rather than an async runtime, a lookup can't simply
//! block on its queries — it's modeled as shared, reference-counted state that advances one
//! round at a time as each query's continuation fires from `Node::poll`.

use crate::common::*;

use std::cell::RefCell;
use std::rc::Rc;

/// Shared bookkeeping common to `find_node` and `get_peers` lookups: the shortlist of known
/// contacts ordered by distance to the target, which of them have been queried or have
/// responded, and the round-termination check from §4.8 step 5.
struct Shortlist {
  target: NodeId,
  contacts: Vec<Contact>,
  queried: HashSet<NodeId>,
  responded: HashSet<NodeId>,
  inflight: usize,
  round_best: Distance,
}

impl Shortlist {
  fn new(target: NodeId, seed: Vec<Contact>) -> Self {
    let mut shortlist = Shortlist {
      target,
      contacts: Vec::new(),
      queried: HashSet::new(),
      responded: HashSet::new(),
      inflight: 0,
      round_best: Distance::MAX,
    };
    shortlist.merge(seed);
    shortlist
  }

  fn merge(&mut self, candidates: Vec<Contact>) {
    for candidate in candidates {
      if !self.contacts.iter().any(|c| c.id == candidate.id) {
        self.contacts.push(candidate);
      }
    }
    let target = self.target;
    self.contacts.sort_by_key(|c| target.distance(&c.id));
    self.contacts.truncate(K.max(ALPHA * 4));
  }

  fn next_to_query(&self) -> Option<Contact> {
    if self.inflight >= ALPHA {
      return None;
    }
    self.contacts.iter().find(|c| !self.queried.contains(&c.id)).cloned()
  }

  /// Re-checks the §4.8 step 5 termination condition and advances `round_best`. Returns whether
  /// another round should be issued.
  fn round_should_continue(&mut self) -> bool {
    let k_closest_all_responded = self
      .contacts
      .iter()
      .take(K)
      .all(|c| self.responded.contains(&c.id));
    let new_best = self
      .contacts
      .first()
      .map(|c| self.target.distance(&c.id))
      .unwrap_or(Distance::MAX);
    let improved = new_best < self.round_best;
    self.round_best = new_best;
    !k_closest_all_responded && improved
  }
}

struct FindNodeLookup {
  shortlist: Shortlist,
  on_done: Option<Box<dyn FnOnce(&mut Node, Vec<Contact>)>>,
}

pub fn find_node_iterative(
  node: &mut Node,
  target: NodeId,
  now: Instant,
  on_done: impl FnOnce(&mut Node, Vec<Contact>) + 'static,
) {
  let seed = node.routing().k_closest(&target, K);
  if seed.is_empty() {
    on_done(node, Vec::new());
    return;
  }

  let lookup = Rc::new(RefCell::new(FindNodeLookup {
    shortlist: Shortlist::new(target, seed),
    on_done: Some(Box::new(on_done)),
  }));
  advance_find_node(node, &lookup, now);
}

fn advance_find_node(node: &mut Node, lookup: &Rc<RefCell<FindNodeLookup>>, now: Instant) {
  loop {
    let next = lookup.borrow().shortlist.next_to_query();
    let contact = match next {
      Some(contact) => contact,
      None => break,
    };
    lookup.borrow_mut().shortlist.queried.insert(contact.id);
    lookup.borrow_mut().shortlist.inflight += 1;

    let target = lookup.borrow().shortlist.target;
    let engine = node.engine_clone();
    let lookup_for_cb = Rc::clone(lookup);
    let sent = engine.find_node(node, contact.addr, target, now, move |node, outcome| {
      on_find_node_reply(node, &lookup_for_cb, contact.id, outcome, now);
    });
    if sent.is_err() {
      let mut l = lookup.borrow_mut();
      l.shortlist.inflight -= 1;
      drop(l);
      if let Some(c) = node.routing_mut().find_contact_mut(&contact.id) {
        c.curse();
      }
    }
  }

  if lookup.borrow().shortlist.inflight == 0 {
    finish_find_node(node, lookup);
  }
}

fn on_find_node_reply(
  node: &mut Node,
  lookup: &Rc<RefCell<FindNodeLookup>>,
  from_id: NodeId,
  outcome: Outcome,
  now: Instant,
) {
  lookup.borrow_mut().shortlist.inflight -= 1;

  match outcome {
    Outcome::Response(r) => {
      lookup.borrow_mut().shortlist.responded.insert(from_id);
      if let Some(contact) = node.routing_mut().find_contact_mut(&from_id) {
        contact.thank(now);
      }
      if let Some(blob) = r.nodes {
        merge_discovered_nodes(node, lookup, &blob, now);
      }
    }
    Outcome::Remote(_) | Outcome::Timeout => {
      if let Some(contact) = node.routing_mut().find_contact_mut(&from_id) {
        contact.curse();
      }
    }
    Outcome::Cancelled => {}
  }

  if lookup.borrow().shortlist.inflight == 0 {
    let should_continue = lookup.borrow_mut().shortlist.round_should_continue();
    if should_continue {
      advance_find_node(node, lookup, now);
    } else {
      finish_find_node(node, lookup);
    }
  }
}

fn merge_discovered_nodes(node: &mut Node, lookup: &Rc<RefCell<FindNodeLookup>>, blob: &[u8], now: Instant) {
  let local_id = node.local_id();
  let mut candidates = Vec::new();
  for (id, addr) in message::decode_compact_nodes(blob) {
    if id == local_id {
      continue;
    }
    node.observe(id, addr, now);
    candidates.push(Contact::new(id, addr, now));
  }
  lookup.borrow_mut().shortlist.merge(candidates);
}

fn finish_find_node(node: &mut Node, lookup: &Rc<RefCell<FindNodeLookup>>) {
  let (results, on_done) = {
    let mut l = lookup.borrow_mut();
    let on_done = l.on_done.take();
    let results = l.shortlist.contacts.iter().take(K).cloned().collect();
    (results, on_done)
  };
  if let Some(on_done) = on_done {
    on_done(node, results);
  }
}

/// Result of an iterative `get_peers` lookup (§4.8 step 6): every distinct peer address found,
/// plus a `(contact, token)` per responder close enough to later `announce_peer` to.
pub struct GetPeersOutcome {
  pub peers: Vec<SocketAddrV4>,
  pub announce_targets: Vec<(Contact, Vec<u8>)>,
}

struct GetPeersLookup {
  shortlist: Shortlist,
  peers: HashSet<SocketAddrV4>,
  tokens: HashMap<NodeId, Vec<u8>>,
  on_done: Option<Box<dyn FnOnce(&mut Node, GetPeersOutcome)>>,
}

pub fn get_peers_iterative(
  node: &mut Node,
  info_hash: NodeId,
  now: Instant,
  on_done: impl FnOnce(&mut Node, GetPeersOutcome) + 'static,
) {
  let seed = node.routing().k_closest(&info_hash, K);
  if seed.is_empty() {
    on_done(
      node,
      GetPeersOutcome {
        peers: Vec::new(),
        announce_targets: Vec::new(),
      },
    );
    return;
  }

  let lookup = Rc::new(RefCell::new(GetPeersLookup {
    shortlist: Shortlist::new(info_hash, seed),
    peers: HashSet::new(),
    tokens: HashMap::new(),
    on_done: Some(Box::new(on_done)),
  }));
  advance_get_peers(node, &lookup, now);
}

fn advance_get_peers(node: &mut Node, lookup: &Rc<RefCell<GetPeersLookup>>, now: Instant) {
  loop {
    let next = lookup.borrow().shortlist.next_to_query();
    let contact = match next {
      Some(contact) => contact,
      None => break,
    };
    lookup.borrow_mut().shortlist.queried.insert(contact.id);
    lookup.borrow_mut().shortlist.inflight += 1;

    let info_hash = lookup.borrow().shortlist.target;
    let engine = node.engine_clone();
    let lookup_for_cb = Rc::clone(lookup);
    let sent = engine.get_peers(node, contact.addr, info_hash, now, move |node, outcome| {
      on_get_peers_reply(node, &lookup_for_cb, contact.clone(), outcome, now);
    });
    if sent.is_err() {
      let mut l = lookup.borrow_mut();
      l.shortlist.inflight -= 1;
      drop(l);
      if let Some(c) = node.routing_mut().find_contact_mut(&contact.id) {
        c.curse();
      }
    }
  }

  if lookup.borrow().shortlist.inflight == 0 {
    finish_get_peers(node, lookup);
  }
}

fn on_get_peers_reply(
  node: &mut Node,
  lookup: &Rc<RefCell<GetPeersLookup>>,
  from: Contact,
  outcome: Outcome,
  now: Instant,
) {
  lookup.borrow_mut().shortlist.inflight -= 1;

  match outcome {
    Outcome::Response(r) => {
      lookup.borrow_mut().shortlist.responded.insert(from.id);
      if let Some(contact) = node.routing_mut().find_contact_mut(&from.id) {
        contact.thank(now);
      }
      if let Some(token) = r.token {
        lookup.borrow_mut().tokens.insert(from.id, token.into_vec());
      }
      if let Some(values) = r.values {
        let mut l = lookup.borrow_mut();
        for value in values {
          if let Some(addr) = message::decode_compact_peer(&value) {
            l.peers.insert(addr);
          }
        }
      }
      if let Some(blob) = r.nodes {
        merge_discovered_get_peers_nodes(node, lookup, &blob, now);
      }
    }
    Outcome::Remote(_) | Outcome::Timeout => {
      if let Some(contact) = node.routing_mut().find_contact_mut(&from.id) {
        contact.curse();
      }
    }
    Outcome::Cancelled => {}
  }

  if lookup.borrow().shortlist.inflight == 0 {
    let should_continue = lookup.borrow_mut().shortlist.round_should_continue();
    if should_continue {
      advance_get_peers(node, lookup, now);
    } else {
      finish_get_peers(node, lookup);
    }
  }
}

fn merge_discovered_get_peers_nodes(
  node: &mut Node,
  lookup: &Rc<RefCell<GetPeersLookup>>,
  blob: &[u8],
  now: Instant,
) {
  let local_id = node.local_id();
  let mut candidates = Vec::new();
  for (id, addr) in message::decode_compact_nodes(blob) {
    if id == local_id {
      continue;
    }
    node.observe(id, addr, now);
    candidates.push(Contact::new(id, addr, now));
  }
  lookup.borrow_mut().shortlist.merge(candidates);
}

fn finish_get_peers(node: &mut Node, lookup: &Rc<RefCell<GetPeersLookup>>) {
  let (outcome, on_done) = {
    let mut l = lookup.borrow_mut();
    let on_done = l.on_done.take();
    let announce_targets = l
      .shortlist
      .contacts
      .iter()
      .take(K)
      .filter_map(|c| l.tokens.get(&c.id).map(|t| (c.clone(), t.clone())))
      .collect();
    let outcome = GetPeersOutcome {
      peers: l.peers.iter().cloned().collect(),
      announce_targets,
    };
    (outcome, on_done)
  };
  if let Some(on_done) = on_done {
    on_done(node, outcome);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn id(byte0: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = byte0;
    NodeId::from_bytes(bytes)
  }

  #[test]
  fn shortlist_merge_dedups_and_sorts_by_distance() {
    let target = id(0);
    let near = Contact::new(id(1), "127.0.0.1:1".parse().unwrap(), Instant::now());
    let far = Contact::new(id(200), "127.0.0.1:2".parse().unwrap(), Instant::now());
    let mut shortlist = Shortlist::new(target, vec![far.clone(), near.clone()]);
    assert_eq!(shortlist.contacts[0].id, near.id);
    shortlist.merge(vec![near]);
    assert_eq!(shortlist.contacts.len(), 2);
  }

  #[test]
  fn round_continues_only_while_improving_and_incomplete() {
    let target = id(0);
    let a = Contact::new(id(1), "127.0.0.1:1".parse().unwrap(), Instant::now());
    let mut shortlist = Shortlist::new(target, vec![a.clone()]);
    assert!(shortlist.round_should_continue());
    shortlist.responded.insert(a.id);
    assert!(!shortlist.round_should_continue());
  }
}
