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

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The configuration for Mailauth.
///
/// This is stored in a TOML file, typically `/etc/mailauth/mailauth.toml`.
/// Every section and every option is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SystemConfig {
    /// Limits and options for SPF evaluation.
    #[serde(default)]
    pub spf: SpfConfig,

    /// Defaults for DKIM body hashing.
    #[serde(default)]
    pub dkim: DkimConfig,
}

impl SystemConfig {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path)?;
        Ok(toml::from_slice(&data)?)
    }
}

/// The defaults are the limits set out by RFC 7208 § 4.6.4.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpfConfig {
    /// The maximum number of mechanisms and modifiers which trigger DNS
    /// queries (`include`, `a`, `mx`, `ptr`, `exists`, `redirect`) that may
    /// be evaluated. Exceeding this is a permanent error.
    pub max_dns_directives: u32,

    /// The maximum number of DNS queries made on behalf of a mechanism which
    /// may return no records. Exceeding this is a permanent error.
    pub max_void_lookups: u32,

    /// The maximum number of names an MX query may return. Exceeding this is a
    /// permanent error.
    pub max_mx_names: usize,

    /// The maximum number of names from a PTR query which are examined. Extra
    /// names are ignored.
    pub max_ptr_names: usize,

    /// The maximum nesting of `include` and `redirect`. Exceeding this is a
    /// permanent error.
    ///
    /// `max_dns_directives` bounds this too; this option only matters if it
    /// is lower.
    pub max_depth: u32,

    /// The number of seconds after which evaluation gives up and reports a
    /// temporary error.
    pub timeout_secs: u64,

    /// The host name substituted for the `%{r}` macro in explanations.
    pub receiver_host: String,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_dns_directives: 10,
            max_void_lookups: 2,
            max_mx_names: 10,
            max_ptr_names: 10,
            max_depth: 10,
            timeout_secs: 20,
            receiver_host: "unknown".to_owned(),
        }
    }
}

impl SpfConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DkimConfig {
    /// The hash algorithm used by `mailauth body-hash` when none is given.
    pub hash_algorithm: String,
    /// The body canonicalisation used by `mailauth body-hash` when none is
    /// given.
    pub canonicalisation: String,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: "sha256".to_owned(),
            canonicalisation: "relaxed".to_owned(),
        }
    }
}
