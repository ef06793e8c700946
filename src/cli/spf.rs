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


use std::net::IpAddr;

use structopt::StructOpt;

use mailauth::spf::{spf_verify, SpfResult, VerifyOptions};
use mailauth::support::dns::HickoryResolver;
use mailauth::support::sysexits::*;
use mailauth::support::system_config::SystemConfig;

/// Evaluate the SPF policy of a domain.
///
/// The result is printed on the first line, followed by the directive that
/// decided it and the explanation published by the domain, if any.
///
/// Queries go to the name servers in the system resolver configuration. The
/// exit status is EX_TEMPFAIL (75) if the result is "temperror", and 0 for
/// every other result.
#[derive(StructOpt)]
pub(super) struct SpfSubcommand {
    /// The IP address of the SMTP client.
    #[structopt(long)]
    pub(super) ip: IpAddr,

    /// The MAIL FROM address.
    #[structopt(long)]
    pub(super) sender: Option<String>,

    /// The HELO/EHLO domain [default: the domain being checked]
    #[structopt(long)]
    pub(super) helo: Option<String>,

    /// The domain whose policy is checked.
    pub(super) domain: String,
}

pub(super) fn spf(config: &SystemConfig, cmd: SpfSubcommand) -> Sysexit {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start Tokio runtime: {e}");
            return EX_SOFTWARE;
        },
    };

    let verdict = runtime.block_on(async {
        let resolver = match HickoryResolver::from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Failed to read resolver configuration: {e}");
                return None;
            },
        };

        let options = VerifyOptions {
            ip: cmd.ip,
            sender: cmd.sender,
            helo: cmd.helo,
        };
        Some(spf_verify(&cmd.domain, &options, &resolver, &config.spf).await)
    });

    let Some(verdict) = verdict else {
        return EX_CONFIG;
    };

    println!("{}", verdict.result);
    if let Some(ref mechanism) = verdict.mechanism {
        println!("mechanism: {mechanism}");
    }
    if let Some(ref explanation) = verdict.explanation {
        println!("explanation: {explanation}");
    }

    if SpfResult::TempError == verdict.result {
        EX_TEMPFAIL
    } else {
        EX_OK
    }
}
