use std::{
    collections::HashSet,
    net::{Ipv4Addr, TcpListener},
    sync::{LazyLock, Mutex, MutexGuard},
};

use crate::{VboxcoreError, VboxcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MAX_PORT_ATTEMPTS: usize = 32;

/// Ports handed out by this process and not yet released. The kernel may return a port again once
/// its probe listener is closed, and two machines must never share a forward.
static HANDED_OUT: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Picks a free TCP port on the loopback interface for a NAT forward.
///
/// The port is probed by binding and immediately releasing it. It is not returned again in the
/// same process until [`release_local_port`] gives it back.
pub fn free_local_port() -> VboxcoreResult<u16> {
    for _ in 0..MAX_PORT_ATTEMPTS {
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?.local_addr()?.port();

        if handed_out()?.insert(port) {
            return Ok(port);
        }
    }

    Err(VboxcoreError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "no free local port found",
    )))
}

/// Makes a port from [`free_local_port`] available again once its machine no longer forwards it.
pub fn release_local_port(port: u16) {
    if let Ok(mut handed_out) = handed_out() {
        handed_out.remove(&port);
    }
}

/// Whether `port` is currently handed out.
#[cfg(test)]
pub(crate) fn local_port_held(port: u16) -> bool {
    handed_out().is_ok_and(|handed_out| handed_out.contains(&port))
}

fn handed_out() -> VboxcoreResult<MutexGuard<'static, HashSet<u16>>> {
    HANDED_OUT
        .lock()
        .map_err(|_| VboxcoreError::Invariant("port table lock poisoned".to_string()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_local_port_does_not_repeat_held_ports() {
        let ports = (0..16)
            .map(|_| free_local_port().unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(ports.len(), 16);
        assert!(!ports.contains(&0));
    }

    #[test]
    fn test_released_port_leaves_the_table() {
        let port = free_local_port().unwrap();
        assert!(local_port_held(port));

        release_local_port(port);
        assert!(!local_port_held(port));

        release_local_port(port);
    }
}
