use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::socks5::codec::{self, CodecError, UdpEnvelope};

/// Largest datagram a UDP socket can hand back; nothing is cut short.
const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to send datagram to relay {relay}: {source}")]
    SendError {
        relay: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to receive datagram from relay: {0}")]
    ReceiveError(#[source] io::Error),
    #[error("No datagram received within {0:?} (relay not forwarding, or blocked by a firewall)")]
    TimeoutExceeded(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One UDP socket used for a single send/receive round trip through the relay.
pub struct UdpRelay {
    socket: UdpSocket,
}

impl UdpRelay {
    pub async fn bind(local: SocketAddr) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| RelayError::BindError {
                addr: local,
                source,
            })?;
        Ok(UdpRelay { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wraps `payload` in an envelope addressed to `destination` and sends it to the relay.
    pub async fn send(
        &self,
        relay: SocketAddr,
        destination: SocketAddr,
        payload: &[u8],
    ) -> Result<usize, RelayError> {
        let packet = codec::encode_udp_envelope(destination, payload)?;
        info!(
            "[UDP] Sending {} bytes via relay {} to {}",
            payload.len(),
            relay,
            destination
        );
        self.socket
            .send_to(&packet, relay)
            .await
            .map_err(|source| RelayError::SendError { relay, source })
    }

    /// Waits at most `limit` for one datagram and unwraps it.
    pub async fn receive(
        &self,
        relay: SocketAddr,
        limit: Duration,
    ) -> Result<(UdpEnvelope, SocketAddr), RelayError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, source) = timeout(limit, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| RelayError::TimeoutExceeded(limit))?
            .map_err(RelayError::ReceiveError)?;

        info!("[UDP] Received {} bytes from {}", len, source);
        if source != relay {
            warn!(
                "[UDP] Reply came from {}, not from the assigned relay {}",
                source, relay
            );
        }
        debug!("[UDP] Raw datagram: {:02x?}", &buf[..len]);

        let envelope = codec::decode_udp_envelope(&buf[..len])?;
        debug!(
            "[UDP] Envelope frag {}, atyp {:#04x}, origin {}, {} payload bytes",
            envelope.fragment,
            envelope.address_type,
            envelope.destination,
            envelope.payload.len()
        );
        Ok((envelope, source))
    }
}
