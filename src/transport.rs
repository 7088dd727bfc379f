use crate::common::*;

use std::net::SocketAddr;

/// The node's one UDP socket, set non-blocking so the event loop can interleave reads with
/// writes and timer work instead of parking in `recv_from` (§5).
pub struct Transport {
  sock: UdpSocket,
}

impl Transport {
  pub fn bind(port: u16) -> Result<Self> {
    let sock = UdpSocket::bind(("0.0.0.0", port)).context(error::Bind { port })?;
    sock.set_nonblocking(true).context(error::Io)?;
    Ok(Transport { sock })
  }

  pub fn local_port(&self) -> Result<u16> {
    self.sock.local_addr().context(error::Io).map(|addr| addr.port())
  }

  pub fn send(&self, bytes: &[u8], to: SocketAddrV4) -> Result<()> {
    self.sock.send_to(bytes, to).context(error::Io)?;
    Ok(())
  }

  /// Drain one datagram, if any is ready. `None` covers both "nothing pending" and a malformed
  /// peer address (IPv6 senders are ignored rather than erroring the whole event loop).
  pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>> {
    match self.sock.recv_from(buf) {
      Ok((len, SocketAddr::V4(addr))) => Ok(Some((len, addr))),
      Ok((_, SocketAddr::V6(_))) => Ok(None),
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
      Err(e) => Err(e).context(error::Io),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn send_and_recv_round_trip_over_loopback() {
    let a = Transport::bind(0).unwrap();
    let b = Transport::bind(0).unwrap();
    let b_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, b.local_port().unwrap());

    a.send(b"hello", b_addr).unwrap();

    let mut buf = [0u8; 64];
    let mut got = None;
    for _ in 0..1000 {
      if let Some((len, _from)) = b.recv(&mut buf).unwrap() {
        got = Some(buf[..len].to_vec());
        break;
      }
      std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(got, Some(b"hello".to_vec()));
  }

  #[test]
  fn recv_on_idle_socket_returns_none() {
    let a = Transport::bind(0).unwrap();
    let mut buf = [0u8; 64];
    assert!(a.recv(&mut buf).unwrap().is_none());
  }
}
