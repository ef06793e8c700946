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
use std::io::{self, Read, Write};
use std::path::PathBuf;

use structopt::StructOpt;

use mailauth::dkim::{self, BodyCanonicalisation, BodyHasher, HashAlgorithm};
use mailauth::support::sysexits::*;
use mailauth::support::system_config::SystemConfig;

/// Compute the DKIM body hash (the bh= tag) of a message body.
///
/// The input is read in full and hashed as the body, unless --message is
/// given, in which case everything up to the first blank line is skipped.
/// The hash is printed in base64.
#[derive(StructOpt)]
pub(super) struct BodyHashSubcommand {
    /// The hash algorithm, "sha1" or "sha256" [default: from configuration]
    #[structopt(long)]
    pub(super) hash: Option<String>,

    /// The body canonicalisation, "simple" or "relaxed"
    /// [default: from configuration]
    #[structopt(long)]
    pub(super) canon: Option<String>,

    /// Only hash this many bytes of the canonical body (the l= tag).
    #[structopt(long)]
    pub(super) limit: Option<u64>,

    /// The input is a complete message rather than just the body.
    #[structopt(long)]
    pub(super) message: bool,

    /// The file to read. "-" reads from standard input.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) input: PathBuf,
}

pub(super) fn body_hash(
    config: &SystemConfig,
    cmd: BodyHashSubcommand,
) -> Sysexit {
    let algorithm = cmd.hash.as_deref().unwrap_or(&config.dkim.hash_algorithm);
    let canonicalisation = cmd
        .canon
        .as_deref()
        .unwrap_or(&config.dkim.canonicalisation);

    let (algorithm, canonicalisation) = match (
        algorithm.parse::<HashAlgorithm>(),
        canonicalisation.parse::<BodyCanonicalisation>(),
    ) {
        (Ok(a), Ok(c)) => (a, c),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("{e}");
            return EX_USAGE;
        },
    };

    let mut input = Vec::new();
    let read_result = if "-" == cmd.input.as_os_str() {
        io::stdin().lock().read_to_end(&mut input)
    } else {
        fs::File::open(&cmd.input).and_then(|mut f| f.read_to_end(&mut input))
    };
    if let Err(e) = read_result {
        eprintln!("Error reading '{}': {}", cmd.input.display(), e);
        return EX_NOINPUT;
    }

    let body = if cmd.message {
        dkim::split_message(&input).1
    } else {
        &input[..]
    };

    let mut hasher =
        BodyHasher::with_limit(algorithm, canonicalisation, cmd.limit);
    if let Err(e) = hasher.write_all(body) {
        eprintln!("Error hashing body: {e}");
        return EX_SOFTWARE;
    }

    match hasher.finish_raw() {
        Ok(hash) => {
            println!("{}", hash.to_base64());
            EX_OK
        },
        Err(e @ dkim::Error::BodyTruncated) => {
            eprintln!("{e}");
            EX_DATAERR
        },
        Err(e) => {
            eprintln!("Error hashing body: {e}");
            EX_SOFTWARE
        },
    }
}
