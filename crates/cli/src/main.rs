use clap::Parser;
use shmcache_core::Result;
use shmcache_daemon::{remove_stale_regions, CliOverrides, Daemon, DaemonConfigLoader};
use shmcache_utils::SignalListener;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "simplecached")]
#[command(about = "Serve cached files to the proxy over shared memory", long_about = None)]
#[command(version)]
struct Cli {
    /// Cache directory, or a manifest of `request-path disk-path` lines
    #[arg(short = 'c', long = "cachedir", value_name = "PATH")]
    cachedir: Option<PathBuf>,

    /// Number of worker threads (1-128, default 3)
    #[arg(short = 't', long = "nthreads", value_name = "N", allow_negative_numbers = true)]
    nthreads: Option<i64>,

    /// Request queue slots (default 16)
    #[arg(short = 's', long = "slots", value_name = "N")]
    slots: Option<usize>,

    /// Bytes moved per chunk (default 4096)
    #[arg(short = 'z', long = "chunk-size", value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Remove shared memory names left by a daemon that did not shut down
    #[arg(long)]
    force: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            cache_dir: self.cachedir.clone(),
            workers: self.nthreads,
            queue_slots: self.slots,
            chunk_size: self.chunk_size,
        }
    }
}

fn main() -> ExitCode {
    // Help and usage errors exit here with 0 and 2.
    let cli = Cli::parse();

    if let Err(e) = shmcache_utils::tracing::init() {
        eprintln!("simplecached: could not initialize logging: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "simplecached failed");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = DaemonConfigLoader::load(cli.config.as_deref())?;
    let config = DaemonConfigLoader::apply_cli_args(config, cli.overrides())?;
    config.validate()?;

    // Registered before any region exists so an early signal still takes
    // the normal shutdown path.
    let mut listener = SignalListener::install()?;

    if cli.force {
        remove_stale_regions(&config.region_names())?;
    }

    let daemon = Daemon::start(config)?;
    let signal = daemon.run_until_signal(&mut listener)?;
    tracing::info!(signal = ?signal, "clean exit");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_short_flags_map_to_overrides() {
        let cli = Cli::try_parse_from(["simplecached", "-c", "locals.txt", "-t", "8", "-z", "1024"])
            .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.cache_dir, Some(PathBuf::from("locals.txt")));
        assert_eq!(overrides.workers, Some(8));
        assert_eq!(overrides.chunk_size, Some(1024));
        assert_eq!(overrides.queue_slots, None);
    }

    #[test]
    fn test_negative_thread_count_reaches_validation() {
        let cli = Cli::try_parse_from(["simplecached", "-t", "-2"]).unwrap();
        assert_eq!(cli.nthreads, Some(-2));
    }
}
