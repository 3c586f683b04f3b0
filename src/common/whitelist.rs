//! Write allow-list
//!
//! Mutating routes are wrapped with [`whitelist_middleware`]; an empty list
//! lets every client through.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
    middleware::Next,
    response::IntoResponse,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Ip(IpAddr),
    /// IPv4 network and prefix length
    Net(u32, u8),
}

/// Client IPs allowed to issue writes
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<Entry>,
}

impl Whitelist {
    /// Parse entries of the form `10.0.0.5`, `::1` or `10.0.0.0/8`
    pub fn parse(raw: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let entry = match item.split_once('/') {
                Some((net, bits)) => {
                    let net: std::net::Ipv4Addr = net.parse().map_err(|_| {
                        Error::InvalidConfig(format!("bad whitelist network: {}", item))
                    })?;
                    let bits: u8 = bits
                        .parse()
                        .ok()
                        .filter(|b| *b <= 32)
                        .ok_or_else(|| {
                            Error::InvalidConfig(format!("bad whitelist prefix: {}", item))
                        })?;
                    Entry::Net(u32::from(net), bits)
                }
                None => Entry::Ip(item.parse().map_err(|_| {
                    Error::InvalidConfig(format!("bad whitelist address: {}", item))
                })?),
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.iter().any(|entry| match (entry, ip) {
            (Entry::Ip(allowed), ip) => *allowed == ip,
            (Entry::Net(net, bits), IpAddr::V4(v4)) => {
                let mask = if *bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(*bits))
                };
                (u32::from(v4) & mask) == (net & mask)
            }
            (Entry::Net(..), IpAddr::V6(_)) => false,
        })
    }
}

/// Reject writes from clients outside the allow-list with 403
pub async fn whitelist_middleware(
    State(whitelist): State<Arc<Whitelist>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if whitelist.is_empty() {
        return next.run(request).await;
    }

    match connect_info {
        Some(ConnectInfo(addr)) if whitelist.allows(addr.ip()) => next.run(request).await,
        Some(ConnectInfo(addr)) => {
            tracing::warn!(client = %addr.ip(), path = %request.uri().path(), "Write rejected by whitelist");
            Error::Forbidden(format!("{} is not whitelisted", addr.ip())).into_response()
        }
        None => Error::Forbidden("unknown client address".into()).into_response(),
    }
}
