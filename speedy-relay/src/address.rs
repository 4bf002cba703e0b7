//! Advertised relay URL

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use url::Url;

/// URL clients can reach the relay at, derived from the bound socket
///
/// A wildcard bind address is not dialable, so it is replaced by the loopback
/// address of the same family.
pub fn advertised_url(addr: SocketAddr) -> Result<Url, url::ParseError> {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };

    Url::parse(&format!("https://{}/", SocketAddr::new(ip, addr.port())))
}
