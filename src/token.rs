use crate::common::*;

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

struct Secret {
  bytes: [u8; 20],
  /// Tag appended to every token this secret mints, so `verify` can find the right secret to
  /// recompute the MAC against without storing any per-address state (§4.3). Distinct from
  /// "current vs previous": a token tagged with epoch N still verifies once that secret has
  /// rotated out of the `current` slot and into `previous`, as long as it hasn't rotated out
  /// entirely.
  epoch: u8,
  minted_at: Instant,
}

impl Secret {
  fn random(epoch: u8, now: Instant) -> Self {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    Secret { bytes, epoch, minted_at: now }
  }
}

/// Issues and verifies short-lived opaque `announce_peer` tokens, tying an announcer to the
/// address it was issued to (§4.3). Accepts tokens minted by the current secret and, within the
/// rotation window, the immediately prior one — so a token issued just before a rotation doesn't
/// expire mid-flight.
pub struct TokenAuthority {
  rotation: Duration,
  current: Secret,
  previous: Option<Secret>,
}

impl TokenAuthority {
  pub fn new(rotation: Duration, now: Instant) -> Self {
    TokenAuthority {
      rotation,
      current: Secret::random(0, now),
      previous: None,
    }
  }

  fn rotate_if_due(&mut self, now: Instant) {
    if now.duration_since(self.current.minted_at) >= self.rotation {
      let next_epoch = self.current.epoch.wrapping_add(1);
      let expired = std::mem::replace(&mut self.current, Secret::random(next_epoch, now));
      self.previous = Some(expired);
    }
  }

  pub fn issue(&mut self, addr: SocketAddrV4, now: Instant) -> Vec<u8> {
    self.rotate_if_due(now);
    let mut token = mac_for(&self.current.bytes, addr).to_vec();
    token.push(self.current.epoch);
    token
  }

  pub fn verify(&mut self, addr: SocketAddrV4, token: &[u8], now: Instant) -> bool {
    self.rotate_if_due(now);

    let (mac_bytes, tag) = match token.split_last() {
      Some((tag, mac_bytes)) => (mac_bytes, *tag),
      None => return false,
    };

    let secret = if tag == self.current.epoch {
      Some(&self.current)
    } else {
      self.previous.as_ref().filter(|secret| secret.epoch == tag)
    };

    match secret {
      Some(secret) => verify_mac(&secret.bytes, addr, mac_bytes),
      None => false,
    }
  }
}

fn address_bytes(addr: SocketAddrV4) -> [u8; 6] {
  let mut buf = [0u8; 6];
  buf[0..4].copy_from_slice(&addr.ip().octets());
  buf[4..6].copy_from_slice(&addr.port().to_be_bytes());
  buf
}

fn mac_for(secret: &[u8; 20], addr: SocketAddrV4) -> impl AsRef<[u8]> {
  let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts keys of any length");
  mac.update(&address_bytes(addr));
  mac.finalize().into_bytes()
}

fn verify_mac(secret: &[u8; 20], addr: SocketAddrV4, mac_bytes: &[u8]) -> bool {
  let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC accepts keys of any length");
  mac.update(&address_bytes(addr));
  mac.verify_slice(mac_bytes).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(port: u16) -> SocketAddrV4 {
    format!("127.0.0.1:{}", port).parse().unwrap()
  }

  #[test]
  fn issued_token_verifies_for_same_address() {
    let mut tokens = TokenAuthority::new(Duration::from_secs(300), Instant::now());
    let token = tokens.issue(addr(6881), Instant::now());
    assert!(tokens.verify(addr(6881), &token, Instant::now()));
  }

  #[test]
  fn token_issued_for_one_address_rejected_from_another() {
    let mut tokens = TokenAuthority::new(Duration::from_secs(300), Instant::now());
    let token = tokens.issue(addr(6881), Instant::now());
    assert!(!tokens.verify(addr(6882), &token, Instant::now()));
  }

  #[test]
  fn garbage_token_is_rejected() {
    let mut tokens = TokenAuthority::new(Duration::from_secs(300), Instant::now());
    assert!(!tokens.verify(addr(6881), &[0u8; 4], Instant::now()));
  }

  #[test]
  fn token_survives_one_rotation_then_expires() {
    let start = Instant::now();
    let mut tokens = TokenAuthority::new(Duration::from_secs(60), start);
    let token = tokens.issue(addr(6881), start);

    let one_rotation_later = start + Duration::from_secs(61);
    assert!(tokens.verify(addr(6881), &token, one_rotation_later));

    let two_rotations_later = start + Duration::from_secs(122);
    assert!(!tokens.verify(addr(6881), &token, two_rotations_later));
  }
}
