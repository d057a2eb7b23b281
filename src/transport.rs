//! Datagram transport used to deliver reports.
//!
//! Delivery is fire-and-forget: a transport reports how many bytes it
//! handed to the network and nothing more.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network not connected")]
    NotConnected,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Transport {
    /// Whether the network is currently usable.
    fn is_connected(&self) -> bool;

    /// Sends one datagram, returning the number of bytes written.
    fn send_datagram(&mut self, endpoint: &Endpoint, datagram: &[u8])
        -> Result<usize, TransportError>;
}

/// Shared link flag. The owner of the network (the daemon's link
/// monitor, a test) flips it; the transport only reads it.
#[derive(Debug, Clone)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// UDP over the host network stack.
///
/// The host has no notion of a joined network, so the link starts up and
/// stays up unless someone holding [`UdpTransport::link`] marks it down.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    resolved: Option<(Endpoint, SocketAddr)>,
    link: LinkState,
}

impl UdpTransport {
    pub fn bind() -> Result<Self, TransportError> {
        Ok(Self {
            socket: UdpSocket::bind(("0.0.0.0", 0))?,
            resolved: None,
            link: LinkState::new(true),
        })
    }

    /// Handle for reporting link changes to this transport.
    pub fn link(&self) -> LinkState {
        self.link.clone()
    }

    fn resolve(&mut self, endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
        if let Some((cached, addr)) = &self.resolved {
            if cached == endpoint {
                return Ok(*addr);
            }
        }
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TransportError::Resolve(endpoint.to_string()))?;
        debug!("resolved {} to {}", endpoint, addr);
        self.resolved = Some((endpoint.clone(), addr));
        Ok(addr)
    }
}

impl Transport for UdpTransport {
    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send_datagram(
        &mut self,
        endpoint: &Endpoint,
        datagram: &[u8],
    ) -> Result<usize, TransportError> {
        let addr = self.resolve(endpoint)?;
        Ok(self.socket.send_to(datagram, addr)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub endpoint: Endpoint,
    pub bytes: Vec<u8>,
}

/// In-memory transport that records every datagram instead of sending it.
/// Clones share the record and the link state.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<SentDatagram>>>,
    connected: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::default(),
            connected: Arc::new(AtomicBool::new(true)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Makes every following write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_sent(&self) -> Vec<SentDatagram> {
        core::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Transport for RecordingTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send_datagram(
        &mut self,
        endpoint: &Endpoint,
        datagram: &[u8],
    ) -> Result<usize, TransportError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentDatagram {
                endpoint: endpoint.clone(),
                bytes: datagram.to_vec(),
            });
        Ok(datagram.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_transport_shares_state() {
        let transport = RecordingTransport::new();
        let mut sender = transport.clone();
        let endpoint = Endpoint::new("localhost", 14739);

        assert_eq!(sender.send_datagram(&endpoint, &[1, 2, 3]).unwrap(), 3);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, endpoint);
        assert_eq!(sent[0].bytes, vec![1, 2, 3]);

        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_udp_transport_follows_link_state() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("127.0.0.1", receiver.local_addr().unwrap().port());
        let mut transport = UdpTransport::bind().unwrap();
        let link = transport.link();
        assert!(transport.is_connected());

        link.set_connected(false);
        assert!(!transport.is_connected());
        link.set_connected(true);
        assert!(transport.is_connected());
        assert_eq!(transport.send_datagram(&endpoint, &[7; 4]).unwrap(), 4);

        let mut buf = [0u8; 8];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        assert_eq!(receiver.recv(&mut buf).unwrap(), 4);
    }

    #[test]
    fn test_recording_transport_failure_modes() {
        let transport = RecordingTransport::new();
        let mut sender = transport.clone();
        transport.set_connected(false);
        assert!(!sender.is_connected());

        transport.set_fail_writes(true);
        let err = sender
            .send_datagram(&Endpoint::new("localhost", 1), &[0])
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_udp_transport_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut transport = UdpTransport::bind().unwrap();

        let written = transport
            .send_datagram(&Endpoint::new("127.0.0.1", port), b"spot")
            .unwrap();
        assert_eq!(written, 4);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"spot");
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::new("report.pskreporter.info", 4739).to_string(),
            "report.pskreporter.info:4739"
        );
    }
}
