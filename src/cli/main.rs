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


use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use structopt::StructOpt;

use mailauth::support::sysexits::*;
use mailauth::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The configuration file to use
    /// [default: /etc/mailauth/mailauth.toml or
    /// /usr/local/etc/mailauth/mailauth.toml if present]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Configure logging with this log4rs configuration file instead of
    /// logging to standard error.
    #[structopt(long, parse(from_os_str))]
    log_config: Option<PathBuf>,

    /// Log more detail. Pass twice for debug logging.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    Spf(super::spf::SpfSubcommand),
    BodyHash(super::body_hash::BodyHashSubcommand),
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    init_logging(options.log_config.as_deref(), options.verbose);
    let system_config = load_config(options.config.as_deref());

    let exit = match options.command {
        Command::Spf(cmd) => super::spf::spf(&system_config, cmd),
        Command::BodyHash(cmd) => {
            super::body_hash::body_hash(&system_config, cmd)
        },
    };
    exit.exit();
}

fn load_config(path: Option<&Path>) -> SystemConfig {
    let path = match path {
        Some(path) => path,
        None => {
            let Some(path) = [
                Path::new("/etc/mailauth/mailauth.toml"),
                Path::new("/usr/local/etc/mailauth/mailauth.toml"),
            ]
            .into_iter()
            .find(|p| p.is_file()) else {
                return SystemConfig::default();
            };
            path
        },
    };

    match SystemConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error in config file at '{}': {}", path.display(), e);
            EX_CONFIG.exit()
        },
    }
}

fn init_logging(log_config: Option<&Path>, verbose: u8) {
    if let Some(log_config) = log_config {
        if let Err(e) =
            log4rs::init_file(log_config, log4rs::config::Deserializers::new())
        {
            eprintln!(
                "Failed to load logging configuration from '{}': {}",
                log_config.display(),
                e,
            );
            EX_CONFIG.exit();
        }
        return;
    }

    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level));

    let result = match config {
        Ok(config) => log4rs::init_config(config)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {e}");
        EX_SOFTWARE.exit();
    }
}
