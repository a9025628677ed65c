//! Service readiness notification.
//!
//! Speaks the sd_notify datagram protocol: when the launcher puts a
//! socket path in `$NOTIFY_SOCKET`, status lines are sent there. The
//! protocol comes from systemd but any service launcher can listen for
//! the `READY=1` line. A missing variable just means nobody is
//! listening; send failures are logged and otherwise ignored.

use std::env;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use tracing::debug;

/// Send a notification state, e.g. `"READY=1\nSTATUS=ready"`.
pub fn notify(state: &str) {
    let Ok(path) = env::var("NOTIFY_SOCKET") else {
        return;
    };
    if let Err(err) = send(&path, state) {
        debug!(%err, "could not notify the service manager");
    }
}

fn send(path: &str, state: &str) -> std::io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    if let Some(name) = path.strip_prefix('@') {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        socket.send_to_addr(state.as_bytes(), &addr)?;
    } else {
        socket.send_to(state.as_bytes(), path)?;
    }
    Ok(())
}
