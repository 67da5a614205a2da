use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A Shadowsocks destination address: either a resolved IP/port pair, or an
/// unresolved domain name with a port, left for the caller to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub async fn resolve(&self, resolver: &dyn crate::dns::DnsResolver) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(host, port) => {
                let ips = resolver.resolve(host).await?;
                let ip = ips
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Dial(format!("no address for {host}")))?;
                Ok(SocketAddr::new(ip, *port))
            }
        }
    }

    /// Parses `ATYP | DST.ADDR | DST.PORT` from the head of `data`, returning
    /// the address and the number of bytes consumed.
    pub fn parse_header(data: &[u8]) -> Result<(Address, usize)> {
        if data.is_empty() {
            return Err(Error::HeaderParse("empty header".to_string()));
        }
        let atyp = data[0];
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 1 + 4 + 2 {
                    return Err(Error::HeaderParse("truncated IPv4 header".to_string()));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)),
                    1 + 4 + 2,
                ))
            }
            ATYP_IPV6 => {
                if data.len() < 1 + 16 + 2 {
                    return Err(Error::HeaderParse("truncated IPv6 header".to_string()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)),
                    1 + 16 + 2,
                ))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(Error::HeaderParse("truncated domain header".to_string()));
                }
                let len = data[1] as usize;
                if data.len() < 2 + len + 2 {
                    return Err(Error::HeaderParse("truncated domain header".to_string()));
                }
                let host = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| Error::HeaderParse("domain is not valid UTF-8".to_string()))?
                    .to_string();
                let port_off = 2 + len;
                let port = u16::from_be_bytes([data[port_off], data[port_off + 1]]);
                Ok((Address::Domain(host, port), 2 + len + 2))
            }
            other => Err(Error::HeaderParse(format!("unknown ATYP 0x{other:02x}"))),
        }
    }

    /// Encodes the reverse of `parse_header`.
    pub fn encode_header(&self) -> Vec<u8> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                let mut out = Vec::with_capacity(7);
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                let mut out = Vec::with_capacity(19);
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Address::Domain(host, port) => {
                let mut out = Vec::with_capacity(2 + host.len() + 2);
                out.push(ATYP_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{addr}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}
