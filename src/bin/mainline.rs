use std::net::SocketAddrV4;
use std::process;
use std::time::Duration;

use log::{error, info};
use mainline::{resolve_v4, Event, Node, NodeConfig};
use structopt::StructOpt;

/// Well-known bootstrap routers that speak the mainline DHT (BEP-5 §"Routers").
const HARDCODED_BOOTSTRAP_NODES: &[&str] = &[
  "router.bittorrent.com:6881",
  "router.utorrent.com:6881",
  "dht.transmissionbt.com:6881",
];

#[derive(StructOpt)]
#[structopt(about = "Run a BitTorrent mainline DHT node.")]
struct Opt {
  /// UDP port to listen on. `0` picks an ephemeral port.
  #[structopt(long, default_value = "0")]
  port: u16,

  /// Additional `host:port` bootstrap contacts, tried alongside the hardcoded routers.
  #[structopt(long = "bootstrap")]
  bootstrap: Vec<String>,

  /// Skip the hardcoded router list and only use `--bootstrap` contacts.
  #[structopt(long)]
  no_default_bootstrap: bool,

  /// Seconds a stored peer record survives without a re-announce.
  #[structopt(long = "peer-ttl-secs", default_value = "3600")]
  peer_ttl_secs: u64,

  /// Cap on the number of distinct infohashes the peer store tracks at once.
  #[structopt(long = "peer-store-capacity")]
  peer_store_capacity: Option<usize>,
}

fn main() {
  pretty_env_logger::init();

  let opt = Opt::from_args();

  if let Err(e) = run(opt) {
    error!("{}", e);
    process::exit(1);
  }
}

fn run(opt: Opt) -> mainline::Result<()> {
  let config = NodeConfig {
    port: opt.port,
    peer_ttl: Duration::from_secs(opt.peer_ttl_secs),
    peer_store_capacity: opt.peer_store_capacity,
    client_version: Some(b"ML01".to_vec()),
    ..NodeConfig::default()
  };

  let mut node = Node::create(config)?;

  let mut bootstrap: Vec<SocketAddrV4> = Vec::new();
  if !opt.no_default_bootstrap {
    for hostport in HARDCODED_BOOTSTRAP_NODES {
      match resolve_v4(hostport) {
        Ok(addr) => bootstrap.push(addr),
        Err(e) => info!("skipping unresolvable bootstrap node {}: {}", hostport, e),
      }
    }
  }
  for hostport in &opt.bootstrap {
    match resolve_v4(hostport) {
      Ok(addr) => bootstrap.push(addr),
      Err(e) => info!("skipping unresolvable bootstrap node {}: {}", hostport, e),
    }
  }

  for addr in bootstrap {
    if let Err(e) = node.connect(addr) {
      info!("failed to contact bootstrap node {}: {}", addr, e);
    }
  }

  loop {
    for event in node.poll(Duration::from_millis(100)) {
      match event {
        Event::Listening(port) => println!("listening:{}", port),
        Event::PeerNew(info_hash, addr) => println!("peer:new {} {}", info_hash, addr),
        Event::PeerDelete(info_hash, addr) => println!("peer:delete {} {}", info_hash, addr),
        Event::Error(message) => error!("{}", message),
      }
    }
    std::thread::sleep(Duration::from_millis(50));
  }
}
