//! Per-call options.

use std::net::SocketAddr;
use std::time::Duration;

use crate::catcher::ErrorCatcher;
use crate::config::Config;
use crate::found::Found;
use crate::streamer::Limit;

/// Whether to send through a broadcast transport instead of per-device ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Broadcast {
    #[default]
    Off,
    /// The configured default broadcast address.
    Default,
    Addr(SocketAddr),
}

impl Broadcast {
    pub fn is_off(&self) -> bool {
        matches!(self, Broadcast::Off)
    }

    pub fn resolve(&self, default: SocketAddr) -> Option<SocketAddr> {
        match self {
            Broadcast::Off => None,
            Broadcast::Default => Some(default),
            Broadcast::Addr(addr) => Some(*addr),
        }
    }
}

impl From<bool> for Broadcast {
    fn from(on: bool) -> Self {
        if on {
            Broadcast::Default
        } else {
            Broadcast::Off
        }
    }
}

impl From<SocketAddr> for Broadcast {
    fn from(addr: SocketAddr) -> Self {
        Broadcast::Addr(addr)
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub broadcast: Broadcast,
    pub find_timeout: Duration,
    pub connect_timeout: Duration,
    pub message_timeout: Duration,
    /// Registry to search and send through instead of the sender's.
    pub found: Option<Found>,
    /// Trust the registry as is; never search before sending.
    pub accept_found: bool,
    pub error_catcher: ErrorCatcher,
    pub no_retry: bool,
    /// Fail before sending if any requested device is missing.
    pub require_all_devices: bool,
    pub limit: Limit,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SendOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broadcast: Broadcast::Off,
            find_timeout: config.find_timeout(),
            connect_timeout: config.connect_timeout(),
            message_timeout: config.message_timeout(),
            found: None,
            accept_found: false,
            error_catcher: ErrorCatcher::Raise,
            no_retry: false,
            require_all_devices: false,
            limit: Limit::new(config.limit),
        }
    }

    pub fn broadcast(mut self, broadcast: impl Into<Broadcast>) -> Self {
        self.broadcast = broadcast.into();
        self
    }

    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn found(mut self, found: Found) -> Self {
        self.found = Some(found);
        self
    }

    pub fn accept_found(mut self, accept: bool) -> Self {
        self.accept_found = accept;
        self
    }

    pub fn error_catcher(mut self, catcher: ErrorCatcher) -> Self {
        self.error_catcher = catcher;
        self
    }

    pub fn no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    pub fn require_all_devices(mut self, require: bool) -> Self {
        self.require_all_devices = require;
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }
}

/// Options for discovery.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub timeout: Duration,
    pub broadcast: Broadcast,
    /// Fail with `FoundNoDevices` when nothing answers.
    pub raise_on_none: bool,
    /// Keep devices that did not answer this time.
    pub ignore_lost: bool,
}

impl FindOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            broadcast: Broadcast::Default,
            raise_on_none: false,
            ignore_lost: false,
        }
    }

    pub fn broadcast(mut self, broadcast: impl Into<Broadcast>) -> Self {
        self.broadcast = broadcast.into();
        self
    }

    pub fn raise_on_none(mut self, raise: bool) -> Self {
        self.raise_on_none = raise;
        self
    }

    pub fn ignore_lost(mut self, ignore: bool) -> Self {
        self.ignore_lost = ignore;
        self
    }
}

/// Options for a single packet.
#[derive(Debug, Clone)]
pub struct SingleOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub no_retry: bool,
    pub broadcast: Broadcast,
    pub found: Option<Found>,
}

impl SingleOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout: Duration::from_secs(10),
            no_retry: false,
            broadcast: Broadcast::Off,
            found: None,
        }
    }
}

impl From<&SendOptions> for SingleOptions {
    fn from(opts: &SendOptions) -> Self {
        Self {
            timeout: opts.message_timeout,
            connect_timeout: opts.connect_timeout,
            no_retry: opts.no_retry,
            broadcast: opts.broadcast,
            found: opts.found.clone(),
        }
    }
}
