//! PROXY protocol v1 framing.
//!
//! Builds the ASCII header line defined by the haproxy PROXY protocol and
//! writes it on a freshly dialed back-end socket, before any forwarded
//! byte. Address family is decided by the front-side peer address, with
//! IPv4-mapped IPv6 addresses reported as plain `TCP4`.

use std::fmt::Write as _;
use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Worst-case v1 header length: two IPv6 addresses plus two ports.
pub(crate) const MAX_V1_HEADER: usize = 107;

/// Whether the address is IPv4, either natively or as the 16-byte
/// IPv4-mapped form (`::ffff:a.b.c.d`).
pub(crate) fn is_ipv4(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}

/// Collapse an IPv4-mapped IPv6 address to its dotted-quad form so the
/// header never mixes `TCP4` with colon-hex endpoints.
pub(crate) fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Build the header line for a session accepted from `src` on local
/// address `dst` (the address the client connected to).
pub(crate) fn v1_header(src: SocketAddr, dst: SocketAddr) -> String {
    let proto = if is_ipv4(src.ip()) { "TCP4" } else { "TCP6" };
    let mut line = String::with_capacity(MAX_V1_HEADER);
    // Infallible: formatting into a String cannot fail.
    let _ = write!(
        line,
        "PROXY {proto} {} {} {} {}\r\n",
        canonical_ip(src.ip()),
        canonical_ip(dst.ip()),
        src.port(),
        dst.port(),
    );
    line
}

/// Write the header on the back-end socket in a single write.
pub(crate) async fn send_v1_header(
    back: &mut TcpStream,
    src: SocketAddr,
    dst: SocketAddr,
) -> io::Result<()> {
    let line = v1_header(src, dst);
    back.write_all(line.as_bytes()).await
}
