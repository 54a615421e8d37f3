// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Address classification and BEP 40 canonical peer priority.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub fn is_public_ipv4(ip: &Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
        return false;
    }
    let o = ip.octets();
    !(o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168))
}

/// First public IPv4 address, else the first address of any kind.
pub fn best_addr(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|a| matches!(a.ip(), IpAddr::V4(v4) if is_public_ipv4(&v4)))
        .or_else(|| addrs.first())
        .copied()
}

/// Canonical priority of the connection between `a` and `b`; higher is dialed first.
pub fn peer_priority(a: SocketAddr, b: SocketAddr) -> u32 {
    if a.ip() == b.ip() {
        let (lo, hi) = if a.port() <= b.port() {
            (a.port(), b.port())
        } else {
            (b.port(), a.port())
        };
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&lo.to_be_bytes());
        buf[2..].copy_from_slice(&hi.to_be_bytes());
        return crc32c::crc32c(&buf);
    }

    match (a.ip(), b.ip()) {
        (IpAddr::V4(x), IpAddr::V4(y)) => {
            let (x, y) = (x.octets(), y.octets());
            let mask: [u8; 4] = if x[..3] == y[..3] {
                [0xFF, 0xFF, 0xFF, 0xFF]
            } else if x[..2] == y[..2] {
                [0xFF, 0xFF, 0xFF, 0x55]
            } else {
                [0xFF, 0xFF, 0x55, 0x55]
            };
            masked_crc(&x, &y, &mask)
        }
        (IpAddr::V6(x), IpAddr::V6(y)) => {
            let (x, y) = (x.octets(), y.octets());
            let mut mask = [0x55u8; 16];
            let prefix = if x[..6] == y[..6] { 7 } else { 6 };
            mask[..prefix].fill(0xFF);
            masked_crc(&x, &y, &mask)
        }
        _ => 0,
    }
}

fn masked_crc<const N: usize>(x: &[u8; N], y: &[u8; N], mask: &[u8; N]) -> u32 {
    let mut mx = *x;
    let mut my = *y;
    for i in 0..N {
        mx[i] &= mask[i];
        my[i] &= mask[i];
    }
    let (first, second) = if mx <= my { (mx, my) } else { (my, mx) };
    let mut buf = Vec::with_capacity(2 * N);
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second);
    crc32c::crc32c(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_public_classification() {
        for private in ["10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.2.244", "127.0.0.1", "169.254.1.1"] {
            assert!(!is_public_ipv4(&private.parse().unwrap()), "{private}");
        }
        for public in ["198.168.2.244", "172.32.0.1", "8.8.8.8"] {
            assert!(is_public_ipv4(&public.parse().unwrap()), "{public}");
        }
    }

    #[test]
    fn test_best_addr_prefers_public_ipv4() {
        let addrs = vec![
            addr("192.168.2.244:59716"),
            addr("127.0.0.1:59716"),
            addr("[::1]:59717"),
            addr("198.168.2.244:59716"),
        ];
        assert_eq!(best_addr(&addrs), Some(addr("198.168.2.244:59716")));
        assert_eq!(best_addr(&addrs[..3]), Some(addr("192.168.2.244:59716")));
        assert_eq!(best_addr(&[]), None);
    }

    #[test]
    fn test_bep40_reference_values() {
        assert_eq!(
            peer_priority(addr("123.213.32.10:0"), addr("98.76.54.32:0")),
            0xec2d7224
        );
        assert_eq!(
            peer_priority(addr("123.213.32.10:0"), addr("123.213.32.234:0")),
            0x99568189
        );
    }

    #[test]
    fn test_priority_is_symmetric() {
        let a = addr("1.2.3.4:100");
        let b = addr("5.6.7.8:200");
        assert_eq!(peer_priority(a, b), peer_priority(b, a));
        let same_ip = addr("1.2.3.4:300");
        assert_eq!(peer_priority(a, same_ip), peer_priority(same_ip, a));
        assert_eq!(peer_priority(a, addr("[::1]:1")), 0);
    }
}
