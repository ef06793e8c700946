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

//! The context-free parts of SPF macro expansion.
//!
//! RFC 7208 § 7.3

use std::borrow::Cow;
use std::fmt::Write as _;
use std::net::IpAddr;

use itertools::Itertools;

/// The maximum length of a domain name produced by macro expansion.
pub const MAX_DOMAIN_LENGTH: usize = 253;

/// Applies the transformers of a `macro-expand` to the raw macro value.
///
/// `value` is split on any character in `delimiters` (`.` if empty),
/// optionally reversed, and only the rightmost `keep_parts` parts are kept.
/// The parts are then rejoined with `.`. If there is nothing to transform,
/// `value` is returned as-is.
pub fn transform<'a>(
    value: Cow<'a, str>,
    keep_parts: Option<usize>,
    reverse: bool,
    delimiters: &str,
) -> Cow<'a, str> {
    let effective_delimiters = if delimiters.is_empty() {
        "."
    } else {
        delimiters
    };
    let is_delimiter = |c: char| effective_delimiters.contains(c);
    let keep = keep_parts.unwrap_or(usize::MAX);

    // Splitting is naïve: adjacent delimiters and delimiters at either end
    // produce empty parts.
    if reverse {
        let it = value.rsplit(is_delimiter);
        let parts = it.clone().count();
        Cow::Owned(it.skip(parts.saturating_sub(keep)).join("."))
    } else if keep_parts.is_some() || !delimiters.is_empty() {
        let it = value.split(is_delimiter);
        let parts = it.clone().count();
        Cow::Owned(it.skip(parts.saturating_sub(keep)).join("."))
    } else {
        value
    }
}

/// URL-encodes `s` for an uppercase macro letter.
///
/// Everything but the RFC 3986 "unreserved" characters is escaped.
pub fn url_encode(s: &str) -> Cow<'_, str> {
    fn is_unreserved(b: u8) -> bool {
        b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
    }

    if s.bytes().all(is_unreserved) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        if is_unreserved(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }

    Cow::Owned(out)
}

/// The value of the `%{i}` macro.
///
/// IPv6 addresses use the dotted-nibble format, as in the RFC 7208 § 7.4
/// examples.
pub fn dotted_ip(ip: IpAddr) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => {
            let mut s = String::with_capacity(63);
            for (i, octet) in ip.octets().into_iter().enumerate() {
                if 0 != i {
                    s.push('.');
                }
                s.push(char::from(HEX[usize::from(octet >> 4)]));
                s.push('.');
                s.push(char::from(HEX[usize::from(octet & 0xF)]));
            }
            s
        },
    }
}

/// The value of the `%{v}` macro.
pub fn ip_version(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "in-addr",
        IpAddr::V6(_) => "ip6",
    }
}

/// Removes labels from the left of `domain` until it is no longer than
/// `MAX_DOMAIN_LENGTH`.
///
/// A single label that is too long on its own is left for name validation to
/// reject.
pub fn truncate_domain(mut domain: &str) -> &str {
    while domain.len() > MAX_DOMAIN_LENGTH {
        match domain.find('.') {
            Some(ix) => domain = &domain[ix + 1..],
            None => break,
        }
    }

    domain
}
