// SPDX-License-Identifier: GPL-2.0-or-later

mod app;
mod config;

use app::DetectorRegistry;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "./configs/vigil.toml";

const HELP: &str = "\
vigil - self-hosted network video recorder

USAGE:
  vigil [COMMAND] [OPTIONS]

COMMANDS:
  run              Run the recorder (default)
  playlist <ID>    Print the HLS playlist for a recording

OPTIONS:
  --config <PATH>  Config file [default: ./configs/vigil.toml]
  -h, --help       Print help
";

enum Command {
    Run { config: PathBuf },
    Playlist { config: PathBuf, recording_id: i64 },
}

fn parse_args() -> Result<Command, pico_args::Error> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let config = args
        .opt_value_from_str::<_, PathBuf>("--config")?
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let command = match args.subcommand()?.as_deref() {
        None | Some("run") => Command::Run { config },
        Some("playlist") => Command::Playlist {
            config,
            recording_id: args.free_from_str()?,
        },
        Some(other) => {
            eprintln!("unknown command: {other}");
            std::process::exit(2);
        }
    };
    Ok(command)
}

#[tokio::main]
async fn main() {
    let command = match parse_args() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to parse arguments: {e}");
            std::process::exit(2);
        }
    };

    // Detector backends register here before startup.
    let detectors = DetectorRegistry::new();

    let result = match command {
        Command::Run { config } => app::run(&config, &detectors).await,
        Command::Playlist {
            config,
            recording_id,
        } => app::print_playlist(&config, recording_id).await,
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
