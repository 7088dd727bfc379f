//! Crate-wide prelude. Every module starts with `use crate::common::*;` instead of
//! repeating the same dozen `use` lines.

pub(crate) use std::{
  cmp::Ordering,
  collections::{BTreeMap, HashMap, HashSet, VecDeque},
  convert::TryInto,
  fmt,
  net::{Ipv4Addr, SocketAddrV4, UdpSocket},
  time::{Duration, Instant},
};

pub(crate) use log::{debug, info, trace, warn};
pub(crate) use rand::Rng;
pub(crate) use serde::{Deserialize, Serialize};
pub(crate) use snafu::{OptionExt, ResultExt};

pub(crate) use crate::{
  bucket::{Bucket, InsertOutcome},
  contact::{Contact, Health},
  engine::Engine,
  error::{self, Error},
  id::{Distance, NodeId},
  lookup,
  message::{self, Body, KrpcError, Message, Query, ResponseFields},
  node::{Event, Node, NodeConfig},
  peer_store::{PeerStore, PeerStoreEvent},
  routing_table::RoutingTable,
  timer::{TimerEvent, TimerId, TimerWheel},
  token::TokenAuthority,
  transaction::{Outcome, TransactionRegistry},
  transport::Transport,
};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Number of contacts a k-bucket holds before it must split or evict.
pub(crate) const K: usize = 8;

/// Iterative lookup concurrency factor.
pub(crate) const ALPHA: usize = 3;
