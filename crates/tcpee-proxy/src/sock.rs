//! Socket-option plumbing: keep-alive policy and the transparent-proxy hook.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

/// TCP keep-alive policy for one side of a session.
///
/// `Default` leaves the period to the OS, `Disabled` turns keep-alive off,
/// `Period` enables it with an explicit time before the first probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepAlive {
    #[default]
    Default,
    Disabled,
    Period(Duration),
}

pub(crate) fn apply_keepalive(sock: SockRef<'_>, policy: KeepAlive) -> io::Result<()> {
    match policy {
        KeepAlive::Default => sock.set_keepalive(true),
        KeepAlive::Disabled => sock.set_keepalive(false),
        KeepAlive::Period(period) => {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
        }
    }
}

/// Enable `IP_TRANSPARENT` on the socket and read it back to verify the
/// kernel accepted it. Requires `CAP_NET_ADMIN` and matching packet-filter
/// rules to be of any use.
#[cfg(target_os = "linux")]
pub(crate) fn set_transparent(sock: SockRef<'_>) -> io::Result<()> {
    sock.set_ip_transparent(true)?;
    if !sock.ip_transparent()? {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "IP_TRANSPARENT not accepted by kernel",
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_transparent(_sock: SockRef<'_>) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent proxying requires Linux IP_TRANSPARENT",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_apply_keepalive_policies() {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0") else {
            return; // sandboxed environments may deny binding
        };

        let sock = SockRef::from(&listener);
        apply_keepalive(sock, KeepAlive::Default).unwrap();

        let sock = SockRef::from(&listener);
        apply_keepalive(sock, KeepAlive::Period(Duration::from_secs(30))).unwrap();

        let sock = SockRef::from(&listener);
        apply_keepalive(sock, KeepAlive::Disabled).unwrap();
        assert!(!SockRef::from(&listener).keepalive().unwrap());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_set_transparent_unsupported_off_linux() {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0") else {
            return;
        };
        let err = set_transparent(SockRef::from(&listener)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
