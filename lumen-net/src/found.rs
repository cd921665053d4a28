//! Registry of discovered devices and how to reach them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use lumen_core::{Service, Target};
use tracing::{debug, error};

use crate::socket::DatagramSocket;
use crate::transport::Transport;

pub type Services = HashMap<Service, Arc<dyn Transport>>;

/// Cheap-to-clone handle; clones share the same table. The lock is never held
/// across an await, so closing replaced transports happens after it is released.
#[derive(Clone, Default)]
pub struct Found {
    inner: Arc<Mutex<HashMap<Target, Services>>>,
}

impl Found {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Target, Services>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Services known for `target`.
    pub fn get(&self, target: &Target) -> Option<Services> {
        self.lock().get(target).cloned()
    }

    /// True only when the device has at least one service.
    pub fn contains(&self, target: &Target) -> bool {
        self.lock().get(target).map_or(false, |s| !s.is_empty())
    }

    pub fn targets(&self) -> Vec<Target> {
        let mut out: Vec<Target> = self
            .lock()
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(t, _)| *t)
            .collect();
        out.sort();
        out
    }

    pub fn serials(&self) -> Vec<String> {
        self.targets().iter().map(Target::serial).collect()
    }

    pub fn len(&self) -> usize {
        self.targets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a transport for `target`. A different endpoint for the same
    /// service replaces the old one, which is then closed.
    pub async fn set(&self, target: Target, transport: Arc<dyn Transport>) {
        let service = transport.service();
        let replaced = {
            let mut table = self.lock();
            let services = table.entry(target).or_default();
            let unchanged = services
                .get(&service)
                .map_or(false, |existing| existing.same_endpoint(transport.as_ref()));
            if unchanged {
                None
            } else {
                services.insert(service, transport)
            }
        };
        if let Some(old) = replaced {
            debug!(serial = %target, ?old, "replacing transport");
            close_quietly(target, old).await;
        }
    }

    /// Forget `target`, closing its transports. Idempotent.
    pub async fn remove(&self, target: &Target) {
        let removed = self.lock().remove(target);
        for transport in removed.into_iter().flat_map(|s| s.into_values()) {
            close_quietly(*target, transport).await;
        }
    }

    /// Forget every device not in `seen`.
    pub async fn remove_lost(&self, seen: &HashSet<Target>) {
        let lost: Vec<Target> = self
            .lock()
            .keys()
            .filter(|t| !seen.contains(t))
            .copied()
            .collect();
        for target in lost {
            debug!(serial = %target, "removing lost device");
            self.remove(&target).await;
        }
    }

    /// Independent copy whose transports send through `socket`.
    pub fn clone_for(&self, socket: Arc<dyn DatagramSocket>) -> Found {
        let table = self
            .lock()
            .iter()
            .map(|(target, services)| {
                let services = services
                    .iter()
                    .map(|(service, t)| (*service, t.clone_for(socket.clone())))
                    .collect();
                (*target, services)
            })
            .collect();
        Found {
            inner: Arc::new(Mutex::new(table)),
        }
    }

    /// Independent copy holding only `targets`. Transports are shared.
    pub fn restricted(&self, targets: &[Target]) -> Found {
        let table = self
            .lock()
            .iter()
            .filter(|(t, _)| targets.contains(t))
            .map(|(t, services)| (*t, services.clone()))
            .collect();
        Found {
            inner: Arc::new(Mutex::new(table)),
        }
    }

    /// Copy in devices from `other` that this registry does not know yet.
    pub fn borrow(&self, other: &Found, socket: Arc<dyn DatagramSocket>) {
        let theirs = other.clone_for(socket);
        let theirs = theirs.lock().clone();
        let mut ours = self.lock();
        for (target, services) in theirs {
            ours.entry(target).or_insert(services);
        }
    }
}

async fn close_quietly(target: Target, transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        error!(serial = %target, error = %e, "failed to close transport");
    }
}

impl fmt::Debug for Found {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.lock();
        let mut map = f.debug_map();
        for (target, services) in table.iter() {
            map.entry(&target.serial(), &services.values().collect::<Vec<_>>());
        }
        map.finish()
    }
}
