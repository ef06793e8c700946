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
use std::mem;
use std::net::IpAddr;

/// Text that should be included at the start of every log statement about
/// one check.
#[derive(Clone, Debug)]
pub struct LogPrefix {
    check: &'static str,
    ip: Option<IpAddr>,
    domain: Option<String>,
    sender: Option<String>,
}

impl LogPrefix {
    pub fn new(check: &'static str) -> Self {
        Self {
            check,
            ip: None,
            domain: None,
            sender: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(sanitise(domain));
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sanitise(sender));
        self
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.check)?;
        if self.ip.is_none() && self.domain.is_none() && self.sender.is_none()
        {
            return Ok(());
        }

        write!(f, "[")?;
        let mut first = true;
        if let Some(ip) = self.ip {
            write!(f, "ip={ip}")?;
            first = false;
        }

        if let Some(ref domain) = self.domain {
            if !mem::take(&mut first) {
                write!(f, " ")?;
            }
            write!(f, "domain={domain}")?;
        }

        if let Some(ref sender) = self.sender {
            if !mem::take(&mut first) {
                write!(f, " ")?;
            }
            write!(f, "sender={sender}")?;
        }

        write!(f, "]")
    }
}

fn sanitise(s: &str) -> String {
    let mut s = s.to_owned();
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
