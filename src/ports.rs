//! Reserved port range shared by concurrently running peers on one host

use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// First port of the process-wide range
pub const PORT_RANGE_START: u16 = 8500;

/// Last port of the process-wide range
pub const PORT_RANGE_END: u16 = 9500;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no available ports in the reserved range")]
    Exhausted,

    #[error("port {0} is still in use")]
    StillInUse(u16),

    #[error("port {0} was not handed out by this registry")]
    NotReserved(u16),
}

#[derive(Debug, Default)]
struct RegistryState {
    available: VecDeque<u16>,
    in_use: HashSet<u16>,
}

/// Hands out free ports from a fixed range
#[derive(Debug)]
pub struct PortRegistry {
    state: Mutex<RegistryState>,
}

impl PortRegistry {
    /// Create a registry over the given range
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                available: range.collect(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// Registry over `PORT_RANGE_START..=PORT_RANGE_END`, shared by the process
    pub fn global() -> &'static PortRegistry {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| PortRegistry::new(PORT_RANGE_START..=PORT_RANGE_END))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take the next queued port that is free on this host.
    ///
    /// Ports bound by other programs go to the back of the queue.
    pub fn acquire(&self) -> Result<u16, PortError> {
        let mut state = self.lock();
        for _ in 0..state.available.len() {
            let Some(port) = state.available.pop_front() else {
                break;
            };
            if is_port_available(port) {
                state.in_use.insert(port);
                return Ok(port);
            }
            state.available.push_back(port);
        }
        Err(PortError::Exhausted)
    }

    /// Return a port to the queue once nothing is bound to it anymore
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        if !is_port_available(port) {
            return Err(PortError::StillInUse(port));
        }
        let mut state = self.lock();
        if !state.in_use.remove(&port) {
            return Err(PortError::NotReserved(port));
        }
        state.available.push_back(port);
        Ok(())
    }

    /// Number of ports currently handed out
    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }
}

/// Probe whether both a TCP listener and a UDP socket can bind the port
pub fn is_port_available(port: u16) -> bool {
    let addr = (Ipv4Addr::UNSPECIFIED, port);
    TcpListener::bind(addr).is_ok() && UdpSocket::bind(addr).is_ok()
}
