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

use thiserror::Error;

/// Reasons a body hash could not be computed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),
    #[error("unsupported body canonicalisation: {0}")]
    UnsupportedCanonicalisation(String),
    #[error("body is shorter than the l= tag indicates")]
    BodyTruncated,
    #[error("unexpected OpenSSL error: {0}")]
    Ssl(openssl::error::ErrorStack),
    #[error("unexpected I/O error: {0}")]
    Io(std::io::Error),
}
