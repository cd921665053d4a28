//! Datagram I/O seam: the engine only ever sends bytes to an address and is
//! handed inbound bytes through `Sender::received_data`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sender::WeakSender;

/// Anything that can put a datagram on the wire.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>>;
}

/// Real UDP socket with broadcast enabled.
pub struct UdpSocketIo {
    socket: Arc<UdpSocket>,
}

impl UdpSocketIo {
    pub async fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Feed every inbound datagram to the sender until it is dropped or the
    /// socket fails.
    pub fn spawn_recv_loop(&self, sender: WeakSender) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = recv_loop(socket, sender).await {
                warn!(error = %e, "receive loop stopped");
            }
        })
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, sender: WeakSender) -> io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(sender) = sender.upgrade() else {
            debug!("sender gone, stopping receive loop");
            return Ok(());
        };
        sender.received_data(&buf[..n], from);
    }
}

impl DatagramSocket for UdpSocketIo {
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        async move {
            self.socket.send_to(bytes, addr).await?;
            Ok(())
        }
        .boxed()
    }
}
