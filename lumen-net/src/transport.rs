//! Per-device send paths.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use lumen_core::Service;

use crate::socket::DatagramSocket;

/// A way of reaching one device (or every device, for broadcasts).
pub trait Transport: Send + Sync + fmt::Debug {
    fn service(&self) -> Service;

    fn addr(&self) -> SocketAddr;

    /// Make the transport ready to send. Bounded by the connect timeout.
    fn spawn(&self) -> BoxFuture<'_, io::Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn send<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Same endpoint, sent through a different socket.
    fn clone_for(&self, socket: Arc<dyn DatagramSocket>) -> Arc<dyn Transport>;

    fn same_endpoint(&self, other: &dyn Transport) -> bool {
        self.service() == other.service() && self.addr() == other.addr()
    }
}

pub struct UdpTransport {
    addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn new(addr: SocketAddr, socket: Arc<dyn DatagramSocket>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<UDP {}>", self.addr)
    }
}

impl Transport for UdpTransport {
    fn service(&self) -> Service {
        Service::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn send<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            if self.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("transport to {} is closed", self.addr),
                ));
            }
            self.socket.send_to(bytes, self.addr).await
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.closed.store(true, Ordering::Release);
        futures::future::ready(Ok(())).boxed()
    }

    fn clone_for(&self, socket: Arc<dyn DatagramSocket>) -> Arc<dyn Transport> {
        UdpTransport::new(self.addr, socket)
    }
}

/// Transport whose close always fails. Counts close attempts.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct FailingClose {
    pub addr: SocketAddr,
    pub closes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingClose {
    pub fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.parse().expect("test address"),
            closes: Default::default(),
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Transport for FailingClose {
    fn service(&self) -> Service {
        Service::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn send<'a>(&'a self, _: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Err(anyhow::anyhow!("socket already gone"))).boxed()
    }

    fn clone_for(&self, _: Arc<dyn DatagramSocket>) -> Arc<dyn Transport> {
        FailingClose::new(&self.addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl DatagramSocket for Recording {
        fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
            self.sent.lock().unwrap().push((bytes.to_vec(), addr));
            futures::future::ready(Ok(())).boxed()
        }
    }

    #[tokio::test]
    async fn sends_to_its_address_until_closed() {
        let socket = Arc::new(Recording::default());
        let addr: SocketAddr = "10.0.0.1:56700".parse().unwrap();
        let t = UdpTransport::new(addr, socket.clone());
        t.send(b"hi").await.unwrap();
        t.close().await.unwrap();
        assert!(t.send(b"again").await.is_err());
        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (b"hi".to_vec(), addr));
    }

    #[test]
    fn same_endpoint_compares_address() {
        let socket: Arc<dyn DatagramSocket> = Arc::new(Recording::default());
        let a = UdpTransport::new("10.0.0.1:56700".parse().unwrap(), socket.clone());
        let b = UdpTransport::new("10.0.0.1:56700".parse().unwrap(), socket.clone());
        let c = UdpTransport::new("10.0.0.2:56700".parse().unwrap(), socket);
        assert!(a.same_endpoint(b.as_ref()));
        assert!(!a.same_endpoint(c.as_ref()));
    }
}
