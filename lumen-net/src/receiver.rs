//! Demultiplex inbound packets to the writer waiting on them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lumen_core::{Packet, Target};
use tokio::sync::mpsc;
use tracing::debug;

/// Correlation key; `None` target is the broadcast slot.
pub type Key = (u32, u8, Option<Target>);

#[derive(Debug, Clone)]
pub struct Received {
    pub packet: Packet,
    pub addr: SocketAddr,
}

type Catcher = Arc<dyn Fn(Packet, SocketAddr) + Send + Sync>;

struct Waiter {
    id: u64,
    tx: mpsc::UnboundedSender<Received>,
}

#[derive(Default)]
pub struct Receiver {
    waiters: Mutex<HashMap<Key, Waiter>>,
    next_id: AtomicU64,
    message_catcher: Mutex<Option<Catcher>>,
}

impl Receiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<Key, Waiter>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start routing packets for `key`. Routing stops when the returned
    /// registration is dropped.
    pub fn register(self: &Arc<Self>, key: Key) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters().insert(key, Waiter { id, tx });
        Registration {
            receiver: self.clone(),
            key,
            id,
            rx,
        }
    }

    /// Receives packets nobody is waiting for.
    pub fn set_message_catcher(&self, catcher: impl Fn(Packet, SocketAddr) + Send + Sync + 'static) {
        let mut slot = match self.message_catcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(catcher));
    }

    /// Route one packet: exact key first, then the broadcast slot for the same
    /// source and sequence. Returns whether a waiter took it.
    pub fn recv(&self, packet: Packet, addr: SocketAddr) -> bool {
        let h = &packet.header;
        let exact = (h.source, h.sequence, h.target);
        let blank = (h.source, h.sequence, None);
        let tx = {
            let waiters = self.waiters();
            waiters
                .get(&exact)
                .or_else(|| waiters.get(&blank))
                .map(|w| w.tx.clone())
        };
        let unrouted = match tx {
            Some(tx) => match tx.send(Received { packet, addr }) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(received)) => received.packet,
            },
            None => packet,
        };
        let catcher = match self.message_catcher.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match catcher {
            Some(catcher) => catcher(unrouted, addr),
            None => debug!(
                serial = %unrouted.serial(),
                pkt_type = unrouted.header.pkt_type,
                source = unrouted.header.source,
                sequence = unrouted.header.sequence,
                "dropping unmatched packet"
            ),
        }
        false
    }

    pub fn pending(&self) -> usize {
        self.waiters().len()
    }
}

pub struct Registration {
    receiver: Arc<Receiver>,
    key: Key,
    id: u64,
    rx: mpsc::UnboundedReceiver<Received>,
}

impl Registration {
    pub fn key(&self) -> Key {
        self.key
    }

    pub async fn recv(&mut self) -> Option<Received> {
        self.rx.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut waiters = self.receiver.waiters();
        if waiters.get(&self.key).map_or(false, |w| w.id == self.id) {
            waiters.remove(&self.key);
        }
    }
}
