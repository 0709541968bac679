//! Host/port validation and listener construction. Grounded on the
//! original implementation's `Address`/`Socket` split: `Address` validates
//! and formats a `host:port` pair, `Socket` owns the fd lifecycle
//! (open → reuseaddr → nonblocking → bind → listen). `mio::net::TcpListener`
//! already gives us the fd-lifecycle half for free on Unix (non-blocking and
//! `SO_REUSEADDR` are set internally by `TcpListener::bind`), so this module
//! only needs to keep the validation half and turn a `ServerConfig`'s
//! `host`/`port` into a bound, listening socket.

use std::net::{Ipv4Addr, SocketAddr};

use mio::net::TcpListener;

use crate::error::Result;

/// Crude check matching the original: digits and dots only. Anything else
/// (hostnames, IPv6) is out of scope — see SPEC_FULL's numeric-IPv4-only
/// non-goal.
fn is_numeric_ipv4(host: &str) -> bool {
    !host.is_empty() && host.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Validates `host` as numeric IPv4 and `port` as a non-zero `u16`, then
/// resolves the pair into a `SocketAddr`.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if port == 0 {
        return Err("port out of range (1..65535)".into());
    }
    if !is_numeric_ipv4(host) {
        return Err(format!("'{}': only numeric IPv4 is supported", host).into());
    }
    let addr: Ipv4Addr = host
        .parse()
        .map_err(|_| format!("'{}': invalid IPv4 address", host))?;
    Ok(SocketAddr::from((addr, port)))
}

/// Binds a non-blocking, `SO_REUSEADDR` listening socket for `host:port`.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = resolve(host, port)?;
    let listener = TcpListener::bind(addr)
        .map_err(|e| format!("bind {}:{}: {}", host, port, e))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_port() {
        assert!(resolve("127.0.0.1", 0).is_err());
    }

    #[test]
    fn rejects_hostname() {
        assert!(resolve("localhost", 8080).is_err());
    }

    #[test]
    fn accepts_numeric_ipv4() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }
}
