//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailauth.
//
// Mailauth is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailauth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailauth. If not, see <http://www.gnu.org/licenses/>.

//! Network membership tests for CIDR notation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Returns whether `a` is in the network `b/cidr_len`.
///
/// A `cidr_len` of `None` requires an exact match, as does any value of 32 or
/// more.
pub fn ipv4_addr_matches(
    a: Ipv4Addr,
    b: Ipv4Addr,
    cidr_len: Option<u32>,
) -> bool {
    let mask = match cidr_len {
        None => u32::MAX,
        Some(0) => 0,
        Some(l) => u32::MAX.checked_shl(32u32.saturating_sub(l)).unwrap_or(0),
    };

    let a = u32::from_be_bytes(a.octets());
    let b = u32::from_be_bytes(b.octets());
    (a & mask) == (b & mask)
}

/// Returns whether `a` is in the network `b/cidr_len`.
///
/// A `cidr_len` of `None` requires an exact match, as does any value of 128
/// or more.
pub fn ipv6_addr_matches(
    a: Ipv6Addr,
    b: Ipv6Addr,
    cidr_len: Option<u32>,
) -> bool {
    let mask = match cidr_len {
        None => u128::MAX,
        Some(0) => 0,
        Some(l) => u128::MAX
            .checked_shl(128u32.saturating_sub(l))
            .unwrap_or(0),
    };

    let a = u128::from_be_bytes(a.octets());
    let b = u128::from_be_bytes(b.octets());
    (a & mask) == (b & mask)
}

/// Tests `ip` against `network` using whichever of the two CIDR lengths
/// applies to the address family.
///
/// Addresses of different families never match.
pub fn ip_matches(
    ip: IpAddr,
    network: IpAddr,
    ipv4_cidr_len: Option<u32>,
    ipv6_cidr_len: Option<u32>,
) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            ipv4_addr_matches(ip, network, ipv4_cidr_len)
        },
        (IpAddr::V6(ip), IpAddr::V6(network)) => {
            ipv6_addr_matches(ip, network, ipv6_cidr_len)
        },
        _ => false,
    }
}
