use std::{io::ErrorKind, net::TcpListener};

/// Whether `port` can currently be bound on loopback.
///
/// Catches ports held by processes the registry does not know about.
pub fn is_bindable(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "bind probe failed");
            false
        }
    }
}
