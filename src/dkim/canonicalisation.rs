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
use std::mem;
use std::str::FromStr;

use super::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BodyCanonicalisation {
    /// RFC 6376 § 3.4.3
    #[default]
    Simple,
    /// RFC 6376 § 3.4.4
    Relaxed,
}

impl fmt::Display for BodyCanonicalisation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Simple => write!(f, "simple"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

impl FromStr for BodyCanonicalisation {
    type Err = Error;

    /// Parses either a bare body canonicalisation or the `header/body` form
    /// of the `c=` tag, in which case only the body part is considered.
    fn from_str(s: &str) -> Result<Self, Error> {
        let body = s.split_once('/').map_or(s, |(_, body)| body);
        if body.eq_ignore_ascii_case("simple") {
            Ok(Self::Simple)
        } else if body.eq_ignore_ascii_case("relaxed") {
            Ok(Self::Relaxed)
        } else {
            Err(Error::UnsupportedCanonicalisation(s.to_owned()))
        }
    }
}

/// Performs body canonicalisation in a streaming fashion.
///
/// Input may be split across `write` calls arbitrarily; the output depends
/// only on the concatenation of the inputs.
///
/// The `finish` method *must* be used to write the final data.
pub struct BodyCanonicaliser<W> {
    inner: W,
    mode: BodyCanonicalisation,
    /// For `Relaxed`, set to true if there is a SP character to be written
    /// upon encountering content on the current line. Upon a line ending,
    /// this flag is cleared without emitting the space.
    holding_space: bool,
    /// Set if the last byte seen was a CR. Whether it is a line ending or
    /// data depends on the byte after it.
    holding_cr: bool,
    /// The number of empty lines seen since the last content. These are only
    /// emitted if more content follows them.
    blank_lines: usize,
    /// Whether any content has been written on the current line.
    mid_line: bool,
    /// Whether any content has been written at all.
    wrote_any: bool,
}

impl<W: Write> BodyCanonicaliser<W> {
    pub fn new(inner: W, mode: BodyCanonicalisation) -> Self {
        Self {
            inner,
            mode,
            holding_space: false,
            holding_cr: false,
            blank_lines: 0,
            mid_line: false,
            wrote_any: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn finish(mut self) -> io::Result<W> {
        // A CR at the very end can't be part of a line ending.
        if mem::take(&mut self.holding_cr) {
            self.write_content(b"\r")?;
        }

        // Any held space is trailing whitespace and any counted blank lines
        // are trailing empty lines, both of which are discarded. An
        // unterminated final line gets its line ending.
        if self.mid_line {
            self.inner.write_all(b"\r\n")?;
        } else if !self.wrote_any && BodyCanonicalisation::Simple == self.mode
        {
            // RFC 6376 § 3.4.3: the empty body is canonicalised as a single
            // CRLF under simple, but § 3.4.4 leaves it empty under relaxed.
            self.inner.write_all(b"\r\n")?;
        }

        Ok(self.inner)
    }

    fn end_line(&mut self) -> io::Result<()> {
        self.holding_space = false;
        if mem::take(&mut self.mid_line) {
            self.inner.write_all(b"\r\n")
        } else {
            self.blank_lines += 1;
            Ok(())
        }
    }

    fn write_content(&mut self, data: &[u8]) -> io::Result<()> {
        while self.blank_lines > 0 {
            static CRLFS: &[u8] = b"\r\n\r\n\r\n\r\n\r\n\r\n\r\n\r\n";
            let n = self.blank_lines.min(CRLFS.len() / 2);
            self.inner.write_all(&CRLFS[..n * 2])?;
            self.blank_lines -= n;
        }

        if mem::take(&mut self.holding_space) {
            self.inner.write_all(b" ")?;
        }

        self.inner.write_all(data)?;
        self.mid_line = true;
        self.wrote_any = true;
        Ok(())
    }
}

impl<W: Write> Write for BodyCanonicaliser<W> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        // Relevant documentation:
        //
        // Simple: RFC 6376 § 3.4.3
        // Basically, we do `s/(\r\n)*$/\r\n/` (anchored on the whole message).
        //
        // Relaxed: RFC 6376 § 3.4.4
        // First, within each line:
        //   s/[ \t]+/ /g
        //   s/[ \t]+$// (anchored on the line)
        // Then `s/(\r\n)*$/\r\n/` again, except that an empty body stays
        // empty.
        //
        // Bodies handed to us may have come from a UNIX mailbox, so a bare LF
        // is treated as a line ending as well. A CR which is not followed by
        // LF is just data.

        let relaxed = BodyCanonicalisation::Relaxed == self.mode;
        let mut rest = src;

        while let Some((&byte, tail)) = rest.split_first() {
            if mem::take(&mut self.holding_cr) {
                if b'\n' == byte {
                    self.end_line()?;
                    rest = tail;
                    continue;
                }

                self.write_content(b"\r")?;
            }

            match byte {
                b'\r' => {
                    self.holding_cr = true;
                    rest = tail;
                },

                b'\n' => {
                    self.end_line()?;
                    rest = tail;
                },

                b' ' | b'\t' if relaxed => {
                    self.holding_space = true;
                    rest = tail;
                },

                _ => {
                    // Write all the non-special characters we can.
                    let len = if relaxed {
                        rest.iter()
                            .position(|&c| {
                                matches!(c, b'\r' | b'\n' | b' ' | b'\t')
                            })
                            .unwrap_or(rest.len())
                    } else {
                        memchr::memchr2(b'\r', b'\n', rest)
                            .unwrap_or(rest.len())
                    };

                    let (content, tail) = rest.split_at(len);
                    self.write_content(content)?;
                    rest = tail;
                },
            }
        }

        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
