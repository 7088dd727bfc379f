use crate::common::*;

/// How an outstanding transaction was resolved (§4.2).
#[derive(Debug)]
pub enum Outcome {
  Response(ResponseFields),
  Remote(KrpcError),
  Timeout,
  Cancelled,
}

/// A continuation invoked exactly once, whenever its transaction resolves. Boxed so the registry
/// can hold a heterogeneous set of them; `FnOnce` enforces the "exactly once" part at the type
/// level.
type Continuation = Box<dyn FnOnce(&mut Node, Outcome)>;

struct Pending {
  continuation: Continuation,
  timer: Option<TimerId>,
}

/// Correlates outbound queries with their eventual responses (§4.2). Transaction ids are kept
/// short — 2 random bytes, extended to 3 only if collisions make that infeasible — since BEP-5
/// puts no floor on `t`'s length and a node rarely has more than `ALPHA` lookups in flight at
/// once.
#[derive(Default)]
pub struct TransactionRegistry {
  pending: HashMap<Vec<u8>, Pending>,
}

const MAX_COLLISION_RETRIES: usize = 8;

impl TransactionRegistry {
  pub fn new() -> Self {
    TransactionRegistry {
      pending: HashMap::new(),
    }
  }

  /// Reserve a fresh transaction id and remember `continuation` against it, to be invoked once
  /// `resolve` or `timeout` fires for that id. The caller schedules the timeout timer itself
  /// (its `TimerEvent::TransactionTimeout` needs the id this call hands back) and reports the
  /// resulting handle via `attach_timer`.
  pub fn register(
    &mut self,
    rng: &mut impl Rng,
    continuation: impl FnOnce(&mut Node, Outcome) + 'static,
  ) -> Vec<u8> {
    let tid = self.fresh_id(rng);
    self.pending.insert(
      tid.clone(),
      Pending {
        continuation: Box::new(continuation),
        timer: None,
      },
    );
    tid
  }

  /// Record the timeout timer for a transaction registered via `register`. A no-op if the
  /// transaction already resolved before the timer could be scheduled.
  pub fn attach_timer(&mut self, tid: &[u8], timer: TimerId) {
    if let Some(pending) = self.pending.get_mut(tid) {
      pending.timer = Some(timer);
    }
  }

  fn fresh_id(&self, rng: &mut impl Rng) -> Vec<u8> {
    for _ in 0..MAX_COLLISION_RETRIES {
      let mut buf = [0u8; 2];
      rng.fill(&mut buf);
      if !self.pending.contains_key(buf.as_ref()) {
        return buf.to_vec();
      }
    }
    loop {
      let mut buf = [0u8; 3];
      rng.fill(&mut buf);
      if !self.pending.contains_key(buf.as_ref()) {
        return buf.to_vec();
      }
    }
  }

  /// True iff `tid` names a transaction this node still has outstanding.
  pub fn contains(&self, tid: &[u8]) -> bool {
    self.pending.contains_key(tid)
  }

  /// Remove the transaction and hand back its continuation and timer, ready to be invoked.
  /// Returns `None` if `tid` is unknown (already resolved, timed out, or never ours — the
  /// caller should treat that as "ignore the datagram", not an error).
  fn take(&mut self, tid: &[u8]) -> Option<(Continuation, Option<TimerId>)> {
    self.pending.remove(tid).map(|p| (p.continuation, p.timer))
  }

  /// Resolve `tid` with `outcome`, cancelling its timeout timer and invoking its continuation.
  /// Takes the continuation out of `self` before calling it so `node` can be mutably borrowed
  /// without aliasing this registry (the continuation may itself call back into `node`'s
  /// registry, e.g. to register a follow-up query).
  pub fn resolve(&mut self, node: &mut Node, tid: &[u8], outcome: Outcome) -> bool {
    match self.take(tid) {
      Some((continuation, timer)) => {
        if let Some(timer) = timer {
          node.timers_mut().cancel(timer);
        }
        continuation(node, outcome);
        true
      }
      None => false,
    }
  }

  /// Resolve every still-pending transaction with `Outcome::Cancelled`, e.g. on `Node::close`.
  pub fn cancel_all(&mut self, node: &mut Node) {
    let tids: Vec<Vec<u8>> = self.pending.keys().cloned().collect();
    for tid in tids {
      self.resolve(node, &tid, Outcome::Cancelled);
    }
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }
}
