use crate::common::*;

#[derive(Debug, snafu::Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
  #[snafu(display("failed to bind UDP socket on port {}: {}", port, source))]
  Bind { port: u16, source: std::io::Error },

  #[snafu(display("UDP I/O error: {}", source))]
  Io { source: std::io::Error },

  #[snafu(display("failed to bencode outbound message: {}", source))]
  Encode { source: bendy::serde::Error },

  #[snafu(display("failed to decode inbound datagram: {}", source))]
  Decode { source: bendy::serde::Error },

  #[snafu(display("malformed KRPC message: {}", message))]
  Malformed { message: String },

  #[snafu(display("node is closed"))]
  Closed,
}
