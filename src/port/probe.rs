//! OS-level port availability probing.

use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

/// Checks whether a port can be bound on this host.
pub trait PortProbe: Send + Sync {
    /// Bind `port`. On success the returned hold owns the socket until dropped.
    fn acquire(&self, port: u16) -> io::Result<PortHold>;
}

/// A bound socket kept open to stop other processes taking the port.
#[derive(Debug)]
pub struct PortHold {
    listener: Option<TcpListener>,
}

impl PortHold {
    /// A hold that owns nothing.
    pub fn empty() -> Self {
        Self { listener: None }
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }
}

impl From<TcpListener> for PortHold {
    fn from(listener: TcpListener) -> Self {
        Self {
            listener: Some(listener),
        }
    }
}

/// Probe by binding a TCP listener on the wildcard address.
#[derive(Debug, Clone)]
pub struct OsProbe {
    bind_addr: IpAddr,
}

impl OsProbe {
    pub fn new() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for OsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProbe for OsProbe {
    fn acquire(&self, port: u16) -> io::Result<PortHold> {
        TcpListener::bind((self.bind_addr, port)).map(PortHold::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_refused() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(OsProbe::new().acquire(port).is_err());
        drop(listener);
    }

    #[test]
    fn test_hold_keeps_port_until_dropped() {
        let probe = OsProbe::new();
        let scratch = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = scratch.local_addr().unwrap().port();
        drop(scratch);

        let hold = probe.acquire(port).unwrap();
        assert!(hold.is_bound());
        assert!(probe.acquire(port).is_err());
        drop(hold);
        assert!(probe.acquire(port).is_ok());
    }
}
