//! Detection of an engine left running by another process.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::trace;

/// Connect timeout used when probing the management interface.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Returns `true` when something accepts TCP connections on `host:port`.
pub fn is_listening(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            trace!(host, port, error = %e, "Cannot resolve probe address");
            return false;
        }
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_listening("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT));
    }

    #[test]
    fn test_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!is_listening("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT));
    }

    #[test]
    fn test_unresolvable_host() {
        assert!(!is_listening("host.invalid", 9042, DEFAULT_PROBE_TIMEOUT));
    }
}
