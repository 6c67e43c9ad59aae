//! Binary entrypoint for randofetch.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use randofetch::command::{capture_output, compose};
use randofetch::config::Configuration;
use randofetch::expand::expand;
use randofetch::fetcher_set::{FetcherSet, render_timing};
use randofetch::library::{self, ImportMode};
use randofetch::paths::Paths;
use randofetch::probe::SystemProber;
use randofetch::scan::scan_images;

/// Randomly run a fetcher program with a randomly selected image.
///
/// Without flags, prints the command line of a random usable fetcher so a
/// shell start-up file can run it. The set of usable fetchers is probed once
/// and cached; use --scan after installing new programs.
#[derive(Debug, Parser)]
#[command(name = "randofetch", version, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Restore the default fetcher configuration (implies --scan)
    #[arg(short, long)]
    reset: bool,

    /// Probe fetchers and images again instead of using the cache
    #[arg(short, long)]
    scan: bool,

    /// Run the chosen fetcher and print its output instead of its command
    #[arg(short, long)]
    disp: bool,

    /// Fetchers slower than this many seconds are dropped while scanning
    #[arg(short, long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Exit silently with success when no fetcher is usable
    #[arg(short, long)]
    quiet: bool,

    /// Directory holding fetchers.yaml
    #[arg(long, value_name = "DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Directory holding the image library and the fetcher cache
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy (or link) images into the image library.
    AddImages {
        #[arg(required = true, value_name = "IMAGE")]
        images: Vec<PathBuf>,
        /// Symlink instead of copying
        #[arg(short, long)]
        link: bool,
        /// Accept files that are not jpg, png or bmp
        #[arg(long)]
        force: bool,
    },
    /// List the images in the library.
    ListImages,
    /// Delete an image from the library.
    RemoveImage {
        /// File name as shown by list-images
        name: String,
    },
}

fn init_tracing(verbosity: u8, quiet: bool) -> Result<()> {
    // stdout carries the command line, so logs go to stderr and stay quiet
    // by default.
    let level = match verbosity {
        0 if quiet => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("randofetch={level}").parse()?);
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose, cli.quiet) {
        eprintln!("randofetch: failed to set up logging: {err:#}");
    }
    let quiet = cli.quiet;

    match try_main(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if quiet && is_empty_set(&err) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn is_empty_set(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<randofetch::Error>(),
            Some(randofetch::Error::EmptyAcceptedSet { .. })
        )
    })
}

async fn try_main(cli: Cli) -> Result<()> {
    let paths = Paths::resolve(cli.config_dir.clone(), cli.data_dir.clone())
        .context("resolving randofetch directories")?;
    paths.ensure_dirs()?;
    info!(
        config = %paths.config_file().display(),
        data = %paths.data_dir.display(),
        "using randofetch directories"
    );

    match &cli.command {
        Some(Commands::AddImages {
            images,
            link,
            force,
        }) => {
            let mode = if *link {
                ImportMode::Link
            } else {
                ImportMode::Copy
            };
            let added = library::add_images(&paths.data_dir, images, mode, *force)?;
            for path in added {
                println!("{}", path.display());
            }
            invalidate_cache(&paths.cache_file())
        }
        Some(Commands::ListImages) => {
            let cfg = Configuration::load_or_init(&paths, false)
                .context("loading fetcher configuration")?;
            for path in library::list_images(&paths.data_dir, &cfg.image_extensions())? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Some(Commands::RemoveImage { name }) => {
            let removed = library::remove_image(&paths.data_dir, name)?;
            println!("removed {}", removed.display());
            invalidate_cache(&paths.cache_file())
        }
        None => fetch(&cli, &paths).await,
    }
}

async fn fetch(cli: &Cli, paths: &Paths) -> Result<()> {
    let rescan = cli.scan || cli.reset;
    if cli.reset {
        info!("restoring default configuration");
    }
    let mut cfg = Configuration::load_or_init(paths, cli.reset)
        .context("loading fetcher configuration")?;
    if let Some(seconds) = cli.timeout {
        cfg = cfg.with_latency_budget(seconds)?;
    }

    let prober = SystemProber::new(cfg.probe_timeout());
    debug!(timeout = ?prober.timeout(), "probe timeout");
    let options = cfg.discovery_options();
    let set = FetcherSet::open_or_discover(&paths.cache_file(), rescan, &options, &prober, || {
        let images = scan_images(&paths.data_dir, &cfg.image_extensions())?;
        if images.is_empty() && cfg.fetchers.iter().any(|f| f.needs_image) {
            warn!(
                dir = %paths.data_dir.display(),
                "no images in the library; image fetchers are skipped"
            );
        }
        Ok(expand(&cfg.fetchers, &cfg.image_methods, &images))
    })
    .await?;

    if rescan {
        info!(
            budget = ?set.latency_budget(),
            accepted = set.accepted().len(),
            "rescan finished"
        );
        eprint!("{}", render_timing(set.timing()));
    }

    let fetcher = set.pick()?;
    if cli.disp {
        let output = capture_output(fetcher).await?;
        print!("{output}");
    } else {
        println!("{}", compose(fetcher));
    }
    Ok(())
}

fn invalidate_cache(cache: &Path) -> Result<()> {
    match std::fs::remove_file(cache) {
        Ok(()) => {
            info!(path = %cache.display(), "image library changed; fetcher cache cleared");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", cache.display())),
    }
}
