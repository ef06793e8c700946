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

//! The body hashing half of DKIM verification (RFC 6376 § 3.4, § 3.7).
//!
//! Header canonicalisation and the signature itself are handled elsewhere; the
//! output of this module is compared against the `bh=` tag.

mod canonicalisation;
mod error;
mod hash;

pub use canonicalisation::{BodyCanonicalisation, BodyCanonicaliser};
pub use error::Error;
pub use hash::{BodyHash, BodyHasher, HashAlgorithm};

/// Splits a full message into its header block and body at the first blank
/// line.
///
/// Both CRLF and bare LF line endings are recognised. If there is no blank
/// line, the whole message is the header and the body is empty.
pub fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    let crlf = memchr::memmem::find(message, b"\r\n\r\n").map(|ix| (ix, 4));
    let lf = memchr::memmem::find(message, b"\n\n").map(|ix| (ix, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => {
            let (ix, len) = if a.0 <= b.0 { a } else { b };
            (&message[..ix], &message[ix + len..])
        },
        (Some((ix, len)), None) | (None, Some((ix, len))) => {
            (&message[..ix], &message[ix + len..])
        },
        (None, None) => (message, &[]),
    }
}
