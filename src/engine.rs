use crate::common::*;

/// Wraps KRPC wire handling: decoding and dispatching inbound datagrams, and originating
/// outbound queries with their continuations registered (§4.8).
///
/// Cheap to clone (its only state is the optional version string) — callers that need to call
/// back into `Node` while holding an `Engine` method clone it out first rather than borrowing
/// `node.engine` and `node` at once.
#[derive(Clone)]
pub struct Engine {
  client_version: Option<Vec<u8>>,
}

impl Engine {
  pub fn new(client_version: Option<Vec<u8>>) -> Self {
    Engine { client_version }
  }

  /// Decode and dispatch one inbound datagram. Malformed messages are dropped silently, per
  /// §4.8 — the engine validates shape before any handler runs, and never raises a decode
  /// failure to the application.
  pub fn handle_datagram(&self, node: &mut Node, bytes: &[u8], from: SocketAddrV4, now: Instant) {
    if node.is_closed() {
      return;
    }

    let message = match message::decode(bytes) {
      Ok(message) => message,
      Err(e) => {
        debug!("dropping malformed datagram from {}: {}", from, e);
        return;
      }
    };

    match message.body {
      Body::Response { r } => {
        let mut transactions = std::mem::take(node.transactions_mut());
        transactions.resolve(node, &message.transaction_id, Outcome::Response(r));
        *node.transactions_mut() = transactions;
      }
      Body::Error { e } => {
        let mut transactions = std::mem::take(node.transactions_mut());
        transactions.resolve(node, &message.transaction_id, Outcome::Remote(e));
        *node.transactions_mut() = transactions;
      }
      Body::Query { query } => {
        if let Some(id) = query.querier_id() {
          node.observe(id, from, now);
        }
        self.handle_query(node, message.transaction_id, query, from, now);
      }
    }
  }

  fn handle_query(&self, node: &mut Node, tid: Vec<u8>, query: Query, from: SocketAddrV4, now: Instant) {
    let self_id = node.local_id();
    let reply = match query {
      Query::Ping { .. } => Ok(ResponseFields::just_id(self_id)),

      Query::FindNode { target, .. } => {
        let nodes = message::encode_compact_nodes(node.routing().k_closest(&target, K).iter());
        Ok(ResponseFields {
          id: self_id,
          token: None,
          nodes: Some(serde_bytes::ByteBuf::from(nodes)),
          values: None,
        })
      }

      Query::GetPeers { info_hash, .. } => {
        let token = node.tokens_mut().issue(from, now);
        let values = node.peer_store().get(&info_hash);
        if values.is_empty() {
          let nodes = message::encode_compact_nodes(node.routing().k_closest(&info_hash, K).iter());
          Ok(ResponseFields {
            id: self_id,
            token: Some(serde_bytes::ByteBuf::from(token)),
            nodes: Some(serde_bytes::ByteBuf::from(nodes)),
            values: None,
          })
        } else {
          Ok(ResponseFields {
            id: self_id,
            token: Some(serde_bytes::ByteBuf::from(token)),
            nodes: None,
            values: Some(values.into_iter().map(message::encode_compact_peer).collect()),
          })
        }
      }

      Query::AnnouncePeer {
        info_hash,
        port,
        token,
        implied_port,
        ..
      } => {
        if node.tokens_mut().verify(from, &token, now) {
          let effective_port = if implied_port.map_or(false, |v| v != 0) {
            from.port()
          } else {
            port
          };
          let peer_addr = SocketAddrV4::new(*from.ip(), effective_port);
          for event in node.peer_store_mut().add(info_hash, peer_addr, now) {
            match event {
              PeerStoreEvent::New(ih, addr) => node.emit(Event::PeerNew(ih, addr)),
              PeerStoreEvent::Delete(ih, addr) => node.emit(Event::PeerDelete(ih, addr)),
            }
          }
          Ok(ResponseFields::just_id(self_id))
        } else {
          Err(KrpcError::bad_token())
        }
      }

      Query::Unknown { method } => {
        debug!("unknown query method {:?} from {}", method, from);
        Err(KrpcError::method_unknown())
      }
    };

    let outgoing = match reply {
      Ok(r) => Message::response(tid, self.client_version.clone(), r),
      Err(e) => Message::error(tid, self.client_version.clone(), e),
    };

    match message::encode(&outgoing) {
      Ok(bytes) => match node.transport() {
        Some(transport) => {
          if let Err(e) = transport.send(&bytes, from) {
            warn!("failed to send reply to {}: {}", from, e);
          }
        }
        None => debug!("dropping reply to {}: node is closed", from),
      },
      Err(e) => warn!("failed to encode reply to {}: {}", from, e),
    }
  }

  pub fn ping(
    &self,
    node: &mut Node,
    to: SocketAddrV4,
    now: Instant,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Result<()> {
    let id = node.local_id();
    self.send_query(node, to, Query::Ping { id }, now, continuation)
  }

  pub fn find_node(
    &self,
    node: &mut Node,
    to: SocketAddrV4,
    target: NodeId,
    now: Instant,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Result<()> {
    let id = node.local_id();
    self.send_query(node, to, Query::FindNode { id, target }, now, continuation)
  }

  pub fn get_peers(
    &self,
    node: &mut Node,
    to: SocketAddrV4,
    info_hash: NodeId,
    now: Instant,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Result<()> {
    let id = node.local_id();
    self.send_query(node, to, Query::GetPeers { id, info_hash }, now, continuation)
  }

  pub fn announce_peer(
    &self,
    node: &mut Node,
    to: SocketAddrV4,
    info_hash: NodeId,
    port: u16,
    token: Vec<u8>,
    now: Instant,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Result<()> {
    let id = node.local_id();
    self.send_query(
      node,
      to,
      Query::AnnouncePeer {
        id,
        info_hash,
        port,
        token: serde_bytes::ByteBuf::from(token),
        implied_port: None,
      },
      now,
      continuation,
    )
  }

  fn send_query(
    &self,
    node: &mut Node,
    to: SocketAddrV4,
    query: Query,
    now: Instant,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Result<()> {
    if node.is_closed() {
      return Err(Error::Closed);
    }

    let mut transactions = std::mem::take(node.transactions_mut());
    let tid = transactions.register(&mut rand::thread_rng(), continuation);
    *node.transactions_mut() = transactions;

    let message = Message::query(tid.clone(), self.client_version.clone(), query);
    let bytes = message::encode(&message)?;
    match node.transport() {
      Some(transport) => transport.send(&bytes, to)?,
      // Unreachable via the `is_closed` guard above; kept in case that check is ever removed.
      None => return Err(Error::Closed),
    }

    let due = now + node.config().response_timeout;
    let timer = node
      .timers_mut()
      .schedule(due, TimerEvent::TransactionTimeout { tid: tid.clone() });
    node.transactions_mut().attach_timer(&tid, timer);

    Ok(())
  }
}
