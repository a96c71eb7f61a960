//! Advisory primary election over the active set.
//!
//! Addresses are ordered numerically: `host:port` pairs whose host is an IP literal compare by
//! address then port, so `9.0.0.1` precedes `10.0.0.2`. IPv4 sorts before IPv6. Addresses with a
//! DNS host name sort after every IP literal and compare as text among themselves.

use std::{
    cmp::Ordering,
    net::{IpAddr, SocketAddr},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum AddressKey<'a> {
    Ip(IpAddr, u16),
    Host(&'a str),
}

fn address_key(address: &str) -> AddressKey<'_> {
    let trimmed = address.trim();
    if let Ok(socket) = trimmed.parse::<SocketAddr>() {
        return AddressKey::Ip(socket.ip(), socket.port());
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return AddressKey::Ip(ip, 0);
    }
    AddressKey::Host(trimmed)
}

/// Total order used to rank node addresses.
pub fn address_order(a: &str, b: &str) -> Ordering {
    address_key(a)
        .cmp(&address_key(b))
        .then_with(|| a.cmp(b))
}

/// Primary among `self_address` and the active peers.
pub fn elect_primary<'a, I>(self_address: &'a str, active: I) -> &'a str
where
    I: IntoIterator<Item = &'a str>,
{
    active
        .into_iter()
        .fold(self_address, |best, candidate| {
            if address_order(candidate, best) == Ordering::Less {
                candidate
            } else {
                best
            }
        })
}

/// Whether the node at `self_address` considers itself primary.
pub fn is_primary<'a, I>(self_address: &'a str, active: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    elect_primary(self_address, active) == self_address
}
