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

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use super::{BodyCanonicalisation, BodyCanonicaliser, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn message_digest(self) -> openssl::hash::MessageDigest {
        match self {
            Self::Sha1 => openssl::hash::MessageDigest::sha1(),
            Self::Sha256 => openssl::hash::MessageDigest::sha256(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    /// Parses a bare hash name, or the `a=` tag form (e.g. `rsa-sha256`), in
    /// which case only the hash part is considered.
    fn from_str(s: &str) -> Result<Self, Error> {
        let hash = s.rsplit_once('-').map_or(s, |(_, hash)| hash);
        if hash.eq_ignore_ascii_case("sha1") {
            Ok(Self::Sha1)
        } else if hash.eq_ignore_ascii_case("sha256") {
            Ok(Self::Sha256)
        } else {
            Err(Error::UnsupportedHashAlgorithm(s.to_owned()))
        }
    }
}

/// The result of hashing a body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyHash {
    /// The raw digest.
    pub digest: Vec<u8>,
    /// The number of bytes the canonicalised body occupies, even if fewer
    /// than that were hashed due to a length limit.
    pub canonical_length: u64,
}

impl BodyHash {
    /// Returns the digest in the form used by the `bh=` tag.
    pub fn to_base64(&self) -> String {
        base64::encode(&self.digest)
    }
}

/// Computes the hash of a message body.
///
/// The body is fed in through the `Write` implementation, in chunks of any
/// size. The resulting hash does not depend on how the body was chunked.
pub struct BodyHasher {
    body_hash: BodyCanonicaliser<DigestWriter>,
}

impl BodyHasher {
    pub fn new(
        algorithm: HashAlgorithm,
        canonicalisation: BodyCanonicalisation,
    ) -> Self {
        Self::with_limit(algorithm, canonicalisation, None)
    }

    /// Like `new`, but only the first `limit` bytes of the canonicalised body
    /// are hashed (i.e., the `l=` tag).
    pub fn with_limit(
        algorithm: HashAlgorithm,
        canonicalisation: BodyCanonicalisation,
        limit: Option<u64>,
    ) -> Self {
        Self {
            body_hash: BodyCanonicaliser::new(
                DigestWriter {
                    digest: openssl::hash::Hasher::new(
                        algorithm.message_digest(),
                    ),
                    limit,
                    bytes_written: 0,
                    bytes_hashed: 0,
                },
                canonicalisation,
            ),
        }
    }

    /// Constructs a hasher from the textual names of the algorithm and
    /// canonicalisation.
    pub fn from_names(
        algorithm: &str,
        canonicalisation: &str,
    ) -> Result<Self, Error> {
        Ok(Self::new(algorithm.parse()?, canonicalisation.parse()?))
    }

    /// The number of canonical bytes produced so far.
    ///
    /// This does not include anything that only `finish` can determine, such
    /// as the final line ending.
    pub fn canonical_length(&self) -> u64 {
        self.body_hash.get_ref().bytes_written
    }

    /// Finishes computing the hash and returns it in base64.
    pub fn finish(self) -> Result<String, Error> {
        self.finish_raw().map(|h| h.to_base64())
    }

    /// Finishes computing the hash.
    ///
    /// If a length limit was set and the canonical body turned out to be
    /// shorter than that, fails with `BodyTruncated`.
    pub fn finish_raw(self) -> Result<BodyHash, Error> {
        let body_hash = self
            .body_hash
            .finish()
            // Should never fail
            .map_err(Error::Io)?;

        let digest = body_hash
            .digest
            .and_then(|mut h| h.finish())
            // We don't expect hashing to ever fail
            .map_err(Error::Ssl)?
            .to_vec();

        if let Some(limit) = body_hash.limit {
            if body_hash.bytes_hashed < limit {
                return Err(Error::BodyTruncated);
            }
        }

        Ok(BodyHash {
            digest,
            canonical_length: body_hash.bytes_written,
        })
    }
}

impl fmt::Debug for BodyHasher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BodyHasher")
            .field("canonical_length", &self.canonical_length())
            .finish_non_exhaustive()
    }
}

impl Write for BodyHasher {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.body_hash.write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.body_hash.flush()
    }
}

/// Implements `Write` with a size limit into an OpenSSL hasher. The `write`
/// implementation itself always succeeds; if an error occurs, it is stored
/// internally.
///
/// Note that the body size is determined *after* canonicalisation, so the size
/// limit needs to be here (within the `BodyCanonicaliser`) and not at a higher
/// level.
struct DigestWriter {
    digest: Result<openssl::hash::Hasher, openssl::error::ErrorStack>,
    limit: Option<u64>,
    bytes_written: u64,
    bytes_hashed: u64,
}

impl Write for DigestWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let remaining = self.limit.map_or(u64::MAX, |l| l - self.bytes_hashed);
        let bytes_to_hash = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(src.len());

        if bytes_to_hash > 0 {
            let result = match self.digest {
                Ok(ref mut digest) => digest.update(&src[..bytes_to_hash]),
                Err(_) => Ok(()),
            };

            if let Err(e) = result {
                self.digest = Err(e);
            }
            self.bytes_hashed += bytes_to_hash as u64;
        }

        self.bytes_written += src.len() as u64;
        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
