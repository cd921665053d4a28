//! The dispatch facade: owns the registry, the receiver and session state,
//! and sends single packets or whole scripts.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lumen_core::{Codec, FrameCodec, Message, Packet, Service, SessionContext, Target};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery;
use crate::error::DispatchError;
use crate::found::Found;
use crate::item::ReplyStream;
use crate::options::{FindOptions, SendOptions, SingleOptions};
use crate::receiver::Receiver;
use crate::reference::Reference;
use crate::result::Reply;
use crate::script::Script;
use crate::socket::{DatagramSocket, UdpSocketIo};
use crate::ticker;
use crate::transport::{Transport, UdpTransport};
use crate::writer::Writer;

/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

/// Does not keep the sender alive.
#[derive(Clone)]
pub struct WeakSender {
    inner: Weak<Inner>,
}

impl WeakSender {
    pub fn upgrade(&self) -> Option<Sender> {
        self.inner.upgrade().map(|inner| Sender { inner })
    }
}

struct Inner {
    socket: Arc<dyn DatagramSocket>,
    codec: Arc<dyn Codec>,
    context: SessionContext,
    found: Found,
    receiver: Arc<Receiver>,
    config: Config,
    broadcast_transports: Mutex<HashMap<SocketAddr, Arc<dyn Transport>>>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Sender {
    pub fn new(socket: Arc<dyn DatagramSocket>, config: Config) -> Self {
        Self::with_parts(socket, Arc::new(FrameCodec), SessionContext::new(), config)
    }

    pub fn with_parts(
        socket: Arc<dyn DatagramSocket>,
        codec: Arc<dyn Codec>,
        context: SessionContext,
        config: Config,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                socket,
                codec,
                context,
                found: Found::new(),
                receiver: Receiver::new(),
                config,
                broadcast_transports: Mutex::new(HashMap::new()),
                stop,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind a UDP socket on all interfaces and start receiving on it.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let io = UdpSocketIo::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
        info!(local = %io.local_addr()?, "bound dispatch socket");
        let sender = Sender::new(io.clone(), config);
        sender.track(io.spawn_recv_loop(sender.downgrade()));
        Ok(sender)
    }

    pub fn downgrade(&self) -> WeakSender {
        WeakSender {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Aborted by `finish`.
    pub fn track(&self, task: JoinHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    pub fn source(&self) -> u32 {
        self.inner.context.source()
    }

    pub fn seq(&self, target: Option<Target>) -> u8 {
        self.inner.context.seq(target)
    }

    pub fn found(&self) -> &Found {
        &self.inner.found
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.inner.receiver
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn socket(&self) -> Arc<dyn DatagramSocket> {
        self.inner.socket.clone()
    }

    /// Default per-call options from config.
    pub fn options(&self) -> SendOptions {
        SendOptions::from_config(&self.inner.config)
    }

    /// Run `script` against the devices `reference` names.
    pub fn send(
        &self,
        script: impl Into<Script>,
        reference: impl Into<Reference>,
        options: SendOptions,
    ) -> ReplyStream {
        script.into().run(reference.into(), self, options)
    }

    /// Inbound datagram. Undecodable bytes are dropped.
    pub fn received_data(&self, bytes: &[u8], addr: SocketAddr) {
        match self.inner.codec.decode(bytes) {
            Ok(packet) => {
                self.inner.receiver.recv(packet, addr);
            }
            Err(e) => debug!(from = %addr, error = %e, "dropping undecodable datagram"),
        }
    }

    /// Remember how to reach `target`. Reserved services are ignored.
    pub async fn add_service(&self, target: Target, service: Service, addr: SocketAddr) {
        if service.is_reserved() {
            debug!(serial = %target, ?service, "ignoring reserved service");
            return;
        }
        let transport: Arc<dyn Transport> = UdpTransport::new(addr, self.socket());
        self.inner.found.set(target, transport).await;
    }

    pub async fn forget(&self, target: &Target) {
        self.inner.found.remove(target).await;
    }

    /// Discover whatever answers. Devices that do not answer are forgotten
    /// unless `ignore_lost`.
    pub async fn find_devices(&self, opts: FindOptions) -> Result<Found, DispatchError> {
        let found_now = discovery::search(self, None, opts.timeout, opts.broadcast).await?;
        if !opts.ignore_lost {
            self.inner.found.remove_lost(&found_now).await;
        }
        if found_now.is_empty() {
            if opts.raise_on_none {
                return Err(DispatchError::FoundNoDevices);
            }
            warn!("didn't find any devices");
        }
        Ok(self.inner.found.clone())
    }

    /// Discover until every one of `serials` has answered or the timeout
    /// passes. Returns the registry and the serials still missing.
    pub async fn find_specific_serials(
        &self,
        serials: &[Target],
        opts: FindOptions,
    ) -> Result<(Found, Vec<Target>), DispatchError> {
        let found_now =
            discovery::search(self, Some(serials), opts.timeout, opts.broadcast).await?;
        if !opts.ignore_lost {
            self.inner.found.remove_lost(&found_now).await;
        }
        if opts.raise_on_none && found_now.is_empty() {
            return Err(DispatchError::FoundNoDevices);
        }
        let missing: Vec<Target> = serials
            .iter()
            .filter(|t| !self.inner.found.contains(t))
            .copied()
            .collect();
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(Target::serial).collect();
            warn!(?missing, "didn't find some devices");
        }
        Ok((self.inner.found.clone(), missing))
    }

    /// Write one packet and wait for whatever its template expects.
    pub async fn send_single(
        &self,
        original: &Message,
        packet: Packet,
        opts: SingleOptions,
    ) -> Result<Vec<Reply>, DispatchError> {
        let default = self.inner.config.default_broadcast;
        let broadcast = match (opts.broadcast.resolve(default), packet.header.target) {
            (Some(addr), _) => Some(addr),
            (None, None) => Some(default),
            (None, Some(_)) => None,
        };
        let transport = match broadcast {
            Some(addr) => self.broadcast_transport(addr),
            None => {
                let found = opts.found.as_ref().unwrap_or(&self.inner.found);
                choose_transport(found, &packet)?
            }
        };
        match tokio::time::timeout(opts.connect_timeout, transport.spawn()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(DispatchError::timed_out(&packet.header)),
        }

        let gaps = self.inner.config.gaps();
        let ticks = ticker::ticks(gaps.schedule(), opts.timeout);
        let writer = Writer::new(
            transport,
            &self.inner.receiver,
            self.inner.codec.clone(),
            original,
            &packet,
            gaps,
            broadcast.is_some(),
        )?;
        let mut stop = self.inner.stop.subscribe();
        tokio::select! {
            result = writer.run(ticks, opts.no_retry) => result,
            _ = stop.wait_for(|stopped| *stopped) => Err(DispatchError::cancelled(&packet.header)),
        }
    }

    fn broadcast_transport(&self, addr: SocketAddr) -> Arc<dyn Transport> {
        lock(&self.inner.broadcast_transports)
            .entry(addr)
            .or_insert_with(|| UdpTransport::new(addr, self.socket()))
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Stop: in-flight packets fail with `MessageCancelled`, background tasks
    /// end and every transport is closed.
    pub async fn finish(&self) {
        self.inner.stop.send_replace(true);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        for target in self.inner.found.targets() {
            self.inner.found.remove(&target).await;
        }
        let broadcasts: Vec<_> = lock(&self.inner.broadcast_transports)
            .drain()
            .map(|(_, t)| t)
            .collect();
        for transport in broadcasts {
            if let Err(e) = transport.close().await {
                warn!(?transport, error = %e, "failed to close broadcast transport");
            }
        }
    }
}

/// Prefer UDP among the services the device advertised.
fn choose_transport(found: &Found, packet: &Packet) -> Result<Arc<dyn Transport>, DispatchError> {
    let serial = packet.serial();
    let services = packet
        .header
        .target
        .and_then(|t| found.get(&t))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DispatchError::FailedToFindDevice {
            serial: serial.clone(),
        })?;
    services
        .get(&Service::Udp)
        .cloned()
        .ok_or(DispatchError::NoDesiredService { serial })
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("source", &self.source())
            .field("found", &self.inner.found)
            .finish()
    }
}
