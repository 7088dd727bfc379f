use crate::common::*;

use std::net::{SocketAddr, ToSocketAddrs};

/// Tunables for a `Node` (§4.8, §5 resource bounds). `Default` mirrors BEP-5's usual
/// recommendations: a 15 minute bucket/contact liveness window and a 1 hour peer TTL.
#[derive(Debug, Clone)]
pub struct NodeConfig {
  pub port: u16,
  pub response_timeout: Duration,
  pub bucket_refresh_interval: Duration,
  pub contact_re_ping_interval: Duration,
  pub peer_ttl: Duration,
  pub peer_store_capacity: Option<usize>,
  pub token_rotation_interval: Duration,
  pub client_version: Option<Vec<u8>>,
}

impl Default for NodeConfig {
  fn default() -> Self {
    NodeConfig {
      port: 0,
      response_timeout: Duration::from_secs(5),
      bucket_refresh_interval: Duration::from_secs(15 * 60),
      contact_re_ping_interval: Duration::from_secs(15 * 60),
      peer_ttl: Duration::from_secs(60 * 60),
      peer_store_capacity: None,
      token_rotation_interval: Duration::from_secs(5 * 60),
      client_version: None,
    }
  }
}

const PEER_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Observable side effects of running the event loop (§5, §8): a new listening port, peers
/// showing up or timing out for an infohash, or a transport-level error worth logging.
#[derive(Debug, Clone)]
pub enum Event {
  Listening(u16),
  PeerNew(NodeId, SocketAddrV4),
  PeerDelete(NodeId, SocketAddrV4),
  Error(String),
}

/// A DHT node: the routing table, peer store, token authority, transaction registry, and timer
/// wheel, driven by one non-blocking UDP socket (§1, §5).
pub struct Node {
  config: NodeConfig,
  local_id: NodeId,
  transport: Option<Transport>,
  routing: RoutingTable,
  transactions: TransactionRegistry,
  tokens: TokenAuthority,
  peer_store: PeerStore,
  timers: TimerWheel,
  engine: Engine,
  events: VecDeque<Event>,
  closed: bool,
}

impl Node {
  pub fn create(config: NodeConfig) -> Result<Self> {
    let now = Instant::now();
    let transport = Transport::bind(config.port)?;
    let local_id = NodeId::generate();
    let engine = Engine::new(config.client_version.clone());

    let port = transport.local_port()?;

    let mut node = Node {
      routing: RoutingTable::new(local_id),
      transactions: TransactionRegistry::new(),
      tokens: TokenAuthority::new(config.token_rotation_interval, now),
      peer_store: PeerStore::new(config.peer_ttl, config.peer_store_capacity),
      timers: TimerWheel::new(),
      engine,
      transport: Some(transport),
      events: VecDeque::new(),
      config,
      local_id,
      closed: false,
    };

    info!("listening on port {} as {}", port, local_id);
    node.events.push_back(Event::Listening(port));
    node.timers.schedule(now + PEER_EXPIRY_SWEEP_INTERVAL, TimerEvent::PeerExpiry);
    node.ensure_bucket_refresh_timers(now);

    Ok(node)
  }

  pub fn local_id(&self) -> NodeId {
    self.local_id
  }

  pub(crate) fn routing(&self) -> &RoutingTable {
    &self.routing
  }

  pub(crate) fn routing_mut(&mut self) -> &mut RoutingTable {
    &mut self.routing
  }

  pub(crate) fn transactions_mut(&mut self) -> &mut TransactionRegistry {
    &mut self.transactions
  }

  pub(crate) fn tokens_mut(&mut self) -> &mut TokenAuthority {
    &mut self.tokens
  }

  pub(crate) fn peer_store(&self) -> &PeerStore {
    &self.peer_store
  }

  pub(crate) fn peer_store_mut(&mut self) -> &mut PeerStore {
    &mut self.peer_store
  }

  pub(crate) fn timers_mut(&mut self) -> &mut TimerWheel {
    &mut self.timers
  }

  pub(crate) fn transport(&self) -> Option<&Transport> {
    self.transport.as_ref()
  }

  pub(crate) fn config(&self) -> &NodeConfig {
    &self.config
  }

  pub(crate) fn engine_clone(&self) -> Engine {
    self.engine.clone()
  }

  pub(crate) fn emit(&mut self, event: Event) {
    self.events.push_back(event);
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed
  }

  /// Insert-or-refresh `id`/`addr` in the routing table (§4.7 `observe`), then bring its
  /// bucket's refresh timer and its own re-ping timer up to date: a freshly split bucket gets a
  /// refresh timer, and a freshly touched contact gets its re-ping deadline pushed out (§4.5,
  /// §4.6).
  pub(crate) fn observe(&mut self, id: NodeId, addr: SocketAddrV4, now: Instant) {
    if id == self.local_id {
      return;
    }
    self.routing_mut().observe(id, addr, now);
    if self.routing.find_contact(&id).is_some() {
      self.refresh_contact_ping_timer(id, now);
    }
    self.ensure_bucket_refresh_timers(now);
  }

  /// Schedule a `BucketRefresh` timer for any bucket that doesn't already have one — the table's
  /// lone bucket at creation, and any bucket produced by a split that hasn't inherited its
  /// parent's timer (§4.6, §9 design note).
  fn ensure_bucket_refresh_timers(&mut self, now: Instant) {
    let interval = self.config.bucket_refresh_interval;
    let los: Vec<NodeId> = self
      .routing
      .buckets()
      .iter()
      .filter(|b| b.refresh_timer.is_none())
      .map(|b| b.lo)
      .collect();

    for lo in los {
      let timer = self.timers.schedule(now + interval, TimerEvent::BucketRefresh { bucket_lo: lo });
      match self.routing_mut().find_by_lo_mut(&lo) {
        Some(bucket) => bucket.refresh_timer = Some(timer),
        None => self.timers.cancel(timer),
      }
    }
  }

  /// Cancel `id`'s outstanding re-ping timer, if any, and schedule its replacement (§4.5).
  fn refresh_contact_ping_timer(&mut self, id: NodeId, now: Instant) {
    let old = self.routing_mut().find_contact_mut(&id).and_then(|c| c.ping_timer.take());
    if let Some(old) = old {
      self.timers.cancel(old);
    }

    let due = now + self.config.contact_re_ping_interval;
    let timer = self.timers.schedule(due, TimerEvent::ContactRePing { contact_id: id });
    match self.routing_mut().find_contact_mut(&id) {
      Some(contact) => contact.ping_timer = Some(timer),
      None => self.timers.cancel(timer),
    }
  }

  /// Seed the routing table via a `find_node` for our own id aimed at `contact` (§4.8 `Node`
  /// API table).
  pub fn connect(&mut self, contact: SocketAddrV4) -> Result<()> {
    let now = Instant::now();
    let target = self.local_id;
    let engine = self.engine_clone();
    engine.find_node(self, contact, target, now, move |node, outcome| {
      if let Outcome::Response(r) = outcome {
        let now = Instant::now();
        node.observe(r.id, contact, now);
        if let Some(blob) = r.nodes {
          let local_id = node.local_id();
          for (id, addr) in message::decode_compact_nodes(&blob) {
            if id != local_id {
              node.observe(id, addr, now);
            }
          }
        }
      }
    })
  }

  /// Resolve the K closest nodes to `info_hash` and announce to each that returned a token
  /// (§4.4, §4.8 step 6).
  pub fn advertise(&mut self, info_hash: NodeId, port: u16) -> Result<()> {
    let now = Instant::now();
    lookup::get_peers_iterative(self, info_hash, now, move |node, outcome| {
      for (contact, token) in outcome.announce_targets {
        let engine = node.engine_clone();
        let now = Instant::now();
        if let Err(e) = engine.announce_peer(node, contact.addr, info_hash, port, token, now, |_, _| {}) {
          warn!("failed to announce to {}: {}", contact.addr, e);
        }
      }
    });
    Ok(())
  }

  /// Cancels all timers, resolves every outstanding transaction with `Outcome::Cancelled`,
  /// closes every bucket and contact, drops the transport socket, and marks the node closed.
  /// Idempotent; no callback fires as a result of anything that happens after this returns
  /// (§5 close semantics).
  pub fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;

    let mut transactions = std::mem::take(&mut self.transactions);
    transactions.cancel_all(self);
    self.transactions = transactions;

    self.timers.cancel_all();
    self.routing_mut().close();
    self.transport = None;
  }

  /// Drain at most one pass of pending I/O and due timers, returning whatever events resulted.
  /// `budget` bounds how long this call may spend draining the socket; it does not block
  /// waiting for new datagrams to arrive (the socket is non-blocking). A no-op once `close` has
  /// been called.
  pub fn poll(&mut self, budget: Duration) -> Vec<Event> {
    if self.closed {
      return Vec::new();
    }

    let deadline = Instant::now() + budget;
    let mut buf = [0u8; 2048];

    loop {
      let received = match &self.transport {
        Some(transport) => transport.recv(&mut buf),
        None => break,
      };
      match received {
        Ok(Some((len, from))) => {
          let datagram = buf[..len].to_vec();
          let now = Instant::now();
          let engine = self.engine_clone();
          engine.handle_datagram(self, &datagram, from, now);
        }
        Ok(None) => break,
        Err(e) => {
          self.events.push_back(Event::Error(e.to_string()));
          break;
        }
      }
      if Instant::now() >= deadline {
        break;
      }
    }

    let now = Instant::now();
    let mut timers = std::mem::take(&mut self.timers);
    let due = timers.pop_due(now);
    self.timers = timers;
    for event in due {
      self.handle_timer(event, now);
    }

    self.events.drain(..).collect()
  }

  fn handle_timer(&mut self, event: TimerEvent, now: Instant) {
    match event {
      TimerEvent::TransactionTimeout { tid } => {
        let mut transactions = std::mem::take(&mut self.transactions);
        transactions.resolve(self, &tid, Outcome::Timeout);
        self.transactions = transactions;
      }

      TimerEvent::PeerExpiry => {
        for evt in self.peer_store.expire(now) {
          if let PeerStoreEvent::Delete(info_hash, addr) = evt {
            self.events.push_back(Event::PeerDelete(info_hash, addr));
          }
        }
        self.timers.schedule(now + PEER_EXPIRY_SWEEP_INTERVAL, TimerEvent::PeerExpiry);
      }

      TimerEvent::BucketRefresh { bucket_lo } => {
        let target = self
          .routing
          .find_by_lo(&bucket_lo)
          .map(|bucket| bucket.random_target(&mut rand::thread_rng()));

        let next = self.timers.schedule(
          now + self.config.bucket_refresh_interval,
          TimerEvent::BucketRefresh { bucket_lo },
        );
        match self.routing_mut().find_by_lo_mut(&bucket_lo) {
          Some(bucket) => bucket.refresh_timer = Some(next),
          None => self.timers.cancel(next),
        }

        if let Some(target) = target {
          lookup::find_node_iterative(self, target, now, |_, _| {});
        }
      }

      TimerEvent::ContactRePing { contact_id } => {
        let addr = self.routing.find_contact(&contact_id).map(|c| c.addr);
        if let Some(addr) = addr {
          let engine = self.engine_clone();
          let sent = engine.ping(self, addr, now, move |node, outcome| {
            let now = Instant::now();
            if let Some(contact) = node.routing_mut().find_contact_mut(&contact_id) {
              match outcome {
                Outcome::Response(_) => contact.thank(now),
                _ => contact.curse(),
              }
            }
            node.refresh_contact_ping_timer(contact_id, now);
          });
          if sent.is_err() {
            if let Some(contact) = self.routing_mut().find_contact_mut(&contact_id) {
              contact.curse();
            }
            self.refresh_contact_ping_timer(contact_id, now);
          }
        }
      }
    }
  }
}

/// Resolve a hostname or dotted-quad `host:port` string to a `SocketAddrV4`, for bootstrap
/// contacts supplied on the command line.
pub fn resolve_v4(hostport: &str) -> Result<SocketAddrV4> {
  hostport
    .to_socket_addrs()
    .context(error::Io)?
    .find_map(|addr| match addr {
      SocketAddr::V4(addr) => Some(addr),
      SocketAddr::V6(_) => None,
    })
    .context(error::Malformed {
      message: format!("could not resolve {} to an IPv4 address", hostport),
    })
}
