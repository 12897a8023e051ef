//! Network Port Discovery for the Embedded Engine
//!
//! The engine listens on five TCP ports. Each one lives in a conventional
//! band so that allocated ports are easy to recognise in logs:
//!
//! ```text
//! storage      7001..=7500   random probe
//! storage ssl  7501..=7999   random probe
//! jmx          8001..=8499   random probe
//! cql          9042..9499    first available
//! rpc/thrift   9160..9999    first available
//! ```
//!
//! Probing a port by binding and releasing it races with every other process
//! on the host. [`PortAllocator::reserve`] therefore keeps the bound listener
//! alive inside a [`PortReservation`] until the engine adopts it or the
//! orchestrator releases it right before activation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{HarnessError, Result};

/// Lowest port the allocator will ever hand out.
pub const MIN_PORT_NUMBER: u16 = 1025;
/// Highest port the allocator will ever hand out.
pub const MAX_PORT_NUMBER: u16 = 65534;
/// Random probes attempted before giving up on a range.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// The listening interfaces of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortName {
    /// Native protocol (CQL) port.
    Cql,
    /// Inter-node storage port.
    Storage,
    /// Inter-node storage port with TLS.
    StorageSsl,
    /// Management (JMX) port.
    Jmx,
    /// Legacy RPC (Thrift) port.
    Rpc,
}

impl PortName {
    /// Every port, in the order the orchestrator resolves them.
    pub const ALL: [PortName; 5] = [
        PortName::Rpc,
        PortName::Cql,
        PortName::Storage,
        PortName::StorageSsl,
        PortName::Jmx,
    ];

    /// Allocation policy used when the caller leaves this port on auto.
    pub fn default_policy(self) -> PortPolicy {
        match self {
            Self::Storage => PortPolicy::Random {
                start: 7001,
                end: 7500,
            },
            Self::StorageSsl => PortPolicy::Random {
                start: 7501,
                end: 7999,
            },
            Self::Jmx => PortPolicy::Random {
                start: 8001,
                end: 8499,
            },
            Self::Cql => PortPolicy::FirstAvailable {
                start: 9042,
                end: 9499,
            },
            Self::Rpc => PortPolicy::FirstAvailable {
                start: 9160,
                end: 9999,
            },
        }
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cql => write!(f, "cql"),
            Self::Storage => write!(f, "storage"),
            Self::StorageSsl => write!(f, "storage_ssl"),
            Self::Jmx => write!(f, "jmx"),
            Self::Rpc => write!(f, "rpc"),
        }
    }
}

/// How a free port is searched for inside a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// Uniformly random candidates in `start..=end`, bounded retries.
    Random { start: u16, end: u16 },
    /// Walk `start..end` in order and take the first free port.
    FirstAvailable { start: u16, end: u16 },
}

/// Resolved ports of one engine instance, keyed by name.
pub type PortMap = BTreeMap<PortName, u16>;

/// A port that is still held open by this process.
#[derive(Debug)]
pub struct PortReservation {
    name: PortName,
    port: u16,
    listener: Option<TcpListener>,
}

impl PortReservation {
    /// A reservation for a port the caller chose explicitly; nothing is held.
    pub fn unheld(name: PortName, port: u16) -> Self {
        Self {
            name,
            port,
            listener: None,
        }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` while the listening socket is still owned.
    pub fn is_held(&self) -> bool {
        self.listener.is_some()
    }

    /// Hand the held socket over to the caller.
    pub fn take_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }

    /// Close the held socket so another process can bind the port.
    pub fn release(&mut self) {
        if self.listener.take().is_some() {
            trace!(name = %self.name, port = self.port, "Released held port");
        }
    }
}

/// Finds free TCP ports and remembers every port it has issued.
pub struct PortAllocator {
    max_attempts: u32,
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    /// Create an allocator with a custom random-probe budget.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// Pick a random free port in `start..=end`.
    ///
    /// At most `max_attempts` candidates are probed; each failed probe draws a
    /// new candidate, so the same port may be tried more than once.
    pub fn allocate(&self, start: u16, end: u16) -> Result<u16> {
        self.probe_random(start, end).map(|(port, _)| port)
    }

    /// Return the first port in `start..end` free on both the loopback literal
    /// and every address `localhost` resolves to.
    pub fn allocate_first_available(&self, start: u16, end: u16) -> Result<u16> {
        self.scan_first(start, end).map(|(port, _)| port)
    }

    /// Allocate a port with `policy` and keep its listener open.
    pub fn reserve(&self, name: PortName, policy: PortPolicy) -> Result<PortReservation> {
        let (port, listener) = match policy {
            PortPolicy::Random { start, end } => self.probe_random(start, end)?,
            PortPolicy::FirstAvailable { start, end } => self.scan_first(start, end)?,
        };
        debug!(name = %name, port, "Reserved port");
        Ok(PortReservation {
            name,
            port,
            listener: Some(listener),
        })
    }

    /// Record a port chosen elsewhere (e.g. configured explicitly) so that it
    /// is never handed out. Returns `false` when it was already taken.
    pub fn claim(&self, port: u16) -> bool {
        let claimed = self.mark_issued(port);
        if claimed {
            trace!(port, "Claimed explicit port");
        }
        claimed
    }

    /// Number of distinct ports handed out or claimed so far.
    pub fn issued_count(&self) -> usize {
        self.lock_issued().len()
    }

    /// Returns `true` when `port` was already handed out by this allocator.
    pub fn was_issued(&self, port: u16) -> bool {
        self.lock_issued().contains(&port)
    }

    fn probe_random(&self, start: u16, end: u16) -> Result<(u16, TcpListener)> {
        let (low, high) = (start.min(end), start.max(end));
        let mut rng = rand::thread_rng();
        for attempt in 1..=self.max_attempts {
            let candidate = rng.gen_range(low..=high);
            if self.was_issued(candidate) {
                trace!(port = candidate, attempt, "Candidate already issued");
                continue;
            }
            if let Some(listener) = bind_random_candidate(candidate) {
                if self.mark_issued(candidate) {
                    return Ok((candidate, listener));
                }
            }
        }
        Err(HarnessError::ResourceExhausted {
            start,
            end,
            attempts: self.max_attempts,
        })
    }

    fn scan_first(&self, start: u16, end: u16) -> Result<(u16, TcpListener)> {
        for candidate in start..end {
            if self.was_issued(candidate) {
                continue;
            }
            if !is_tcp_port_available("localhost", candidate) {
                continue;
            }
            let Some(listener) = bind_tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, candidate)))
            else {
                continue;
            };
            if self.mark_issued(candidate) {
                return Ok((candidate, listener));
            }
        }
        Err(HarnessError::ResourceExhausted {
            start,
            end,
            attempts: u32::from(end.saturating_sub(start)),
        })
    }

    fn mark_issued(&self, port: u16) -> bool {
        self.lock_issued().insert(port)
    }

    fn lock_issued(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        // The set is only ever inserted into, so a poisoned guard is still consistent.
        self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe `port` on the wildcard address for both TCP and UDP.
///
/// Ports outside `MIN_PORT_NUMBER..=MAX_PORT_NUMBER` are never available.
pub fn is_available(port: u16) -> bool {
    bind_random_candidate(port).is_some()
}

/// Check whether `port` can be bound on `hostname` right now.
pub fn is_tcp_port_available(hostname: &str, port: u16) -> bool {
    let Ok(addrs) = (hostname, port).to_socket_addrs() else {
        return false;
    };
    // Addresses the host cannot bind at all (e.g. `::1` without IPv6) are
    // skipped; a port in use on any bindable address is not available.
    let mut bound_any = false;
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(_) => bound_any = true,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return false,
            Err(e) => trace!(addr = %addr, error = %e, "Skipping unbindable address"),
        }
    }
    bound_any
}

fn bind_random_candidate(port: u16) -> Option<TcpListener> {
    if !(MIN_PORT_NUMBER..=MAX_PORT_NUMBER).contains(&port) {
        return None;
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = bind_tcp(addr)?;
    UdpSocket::bind(addr).ok()?;
    Some(listener)
}

fn bind_tcp(addr: SocketAddr) -> Option<TcpListener> {
    TcpListener::bind(addr).ok()
}
