use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use composeapp::app::layout::list_apps;
use composeapp::config::Config;
use composeapp::install::InstallProgress;
use composeapp::progress::Reporter;
use composeapp::update::{Env, InitOptions, Runner, Update};
use composeapp::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "composeapp")]
#[command(about = "Fetch, install and update compose apps shipped as OCI artifacts", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $COMPOSEAPP_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the blob store root
    #[arg(long)]
    store: Option<PathBuf>,

    /// Override the root of installed compose projects
    #[arg(long)]
    compose: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List apps with a layout in the store
    Ls,
    /// Report whether apps are fetched, installed and running
    Check {
        /// Digest-pinned app references
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// Remove store blobs no stored app references
    Prune,
    /// Drive an update of the device's app set
    Update {
        #[command(subcommand)]
        command: UpdateCommands,
    },
}

#[derive(Subcommand)]
enum UpdateCommands {
    /// Create an update record for a new app set
    Start {
        /// Digest-pinned app references
        refs: Vec<String>,

        /// Caller-chosen label stored with the update
        #[arg(long, default_value = "")]
        client_ref: String,

        /// Allow an update that stops every app
        #[arg(long)]
        allow_empty: bool,
    },
    /// Load the app trees and work out what is missing
    Init {
        /// Skip straight to started when the apps already run
        #[arg(long)]
        check_status: bool,

        /// Allow an update without apps
        #[arg(long)]
        allow_empty: bool,
    },
    /// Copy missing blobs into the store
    Fetch,
    /// Load images and write compose projects
    Install,
    /// Start the updated apps
    Run,
    /// Finish the update
    Complete {
        /// Remove apps and blobs the update no longer needs
        #[arg(long)]
        prune: bool,
    },
    /// Roll the current update back
    Cancel,
    /// Print the current or last update
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let is_update = matches!(cli.command, Commands::Update { .. });
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            if is_update {
                // -1 as seen by the shell
                ExitCode::from(255)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store_root = store;
    }
    if let Some(compose) = cli.compose {
        config.compose_root = compose;
    }
    config.validate()?;

    let runner = Runner::new(Env::from_config(config)?);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, stopping");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Ls => cmd_ls(&runner).await,
        Commands::Check { refs } => cmd_check(&runner, &refs).await,
        Commands::Prune => cmd_prune(&runner).await,
        Commands::Update { command } => cmd_update(&runner, command, &cancel).await,
    }
}

async fn cmd_ls(runner: &Runner) -> Result<()> {
    let apps = list_apps(&runner.env().store).await?;
    if apps.is_empty() {
        println!("no apps in {}", runner.env().store.root().display());
    }
    for app in apps {
        println!("{}\t{}", app.name, app.spec);
    }
    Ok(())
}

async fn cmd_check(runner: &Runner, refs: &[String]) -> Result<()> {
    let report = runner.status(refs).await?;
    for app in &report.apps {
        println!("{} ({})", app.app, app.uri);
        println!("  fetched:   {}", yes_no(app.fetched()));
        for (digest, state) in &app.missing_blobs {
            println!("    {digest}: {state:?}");
        }
        println!("  installed: {}", yes_no(app.installed()));
        for image in &app.missing_images {
            println!("    missing image {image}");
        }
        println!("  running:   {}", yes_no(app.running()));
        for service in &app.not_running {
            println!("    {service} is not running");
        }
    }
    Ok(())
}

async fn cmd_prune(runner: &Runner) -> Result<()> {
    let stats = runner.prune_store().await?;
    println!(
        "removed {} blobs, freed {} bytes",
        stats.removed.len(),
        stats.freed_bytes
    );
    Ok(())
}

async fn cmd_update(runner: &Runner, command: UpdateCommands, cancel: &CancellationToken) -> Result<()> {
    let update = match command {
        UpdateCommands::Start {
            refs,
            client_ref,
            allow_empty,
        } => runner.create(&client_ref, refs, allow_empty).await?,
        UpdateCommands::Init {
            check_status,
            allow_empty,
        } => {
            let opts = InitOptions {
                check_status,
                allow_empty_app_list: allow_empty,
            };
            runner.init(opts, cancel).await?
        }
        UpdateCommands::Fetch => fetch_with_progress(runner, cancel).await?,
        UpdateCommands::Install => install_with_progress(runner, cancel).await?,
        UpdateCommands::Run => runner.start(cancel).await?,
        UpdateCommands::Complete { prune } => runner.complete(prune, cancel).await?,
        UpdateCommands::Cancel => runner.cancel(cancel).await?,
        UpdateCommands::Show => {
            let update = match runner.current().await {
                Err(e) if e.is_not_found() => runner.last_completed().await?,
                other => other?,
            };
            print_update(&update);
            return Ok(());
        }
    };
    println!("update {} is {}", update.id, update.state);
    Ok(())
}

/// Snapshot of a fetch for the progress bar.
struct FetchSample {
    total: u64,
    fetched: u64,
    fetched_blobs: usize,
    blobs: usize,
}

async fn fetch_with_progress(runner: &Runner, cancel: &CancellationToken) -> Result<Update> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .map_err(|e| Error::Internal(format!("progress template: {e}")))?
            .progress_chars("#>-"),
    );
    bar.set_message("fetching");

    let view = bar.clone();
    let reporter = Reporter::new(16, move |s: FetchSample| {
        view.set_length(s.total);
        view.set_position(s.fetched);
        view.set_message(format!("fetched {}/{} blobs", s.fetched_blobs, s.blobs));
    });
    let result = runner
        .fetch(cancel, |u| {
            reporter.update(FetchSample {
                total: u.total_blobs_bytes,
                fetched: u.fetched_bytes,
                fetched_blobs: u.fetched_blobs,
                blobs: u.blobs.len(),
            });
        })
        .await;
    reporter.stop(true).await;
    match &result {
        Ok(_) => bar.finish_with_message("fetched"),
        Err(_) => bar.abandon_with_message("failed"),
    }
    result
}

async fn install_with_progress(runner: &Runner, cancel: &CancellationToken) -> Result<Update> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}")
            .map_err(|e| Error::Internal(format!("progress template: {e}")))?,
    );
    spinner.enable_steady_tick(Duration::from_millis(120));

    let view = spinner.clone();
    let reporter = Reporter::new(64, move |p: InstallProgress| {
        let msg = match &p.image {
            Some(event) if event.total > 0 => format!(
                "{}: {:?} {} {}/{}",
                p.app, event.state, event.image_id, event.current, event.total
            ),
            Some(event) => format!("{}: {:?} {}", p.app, event.state, event.image_id),
            None => format!("{}: {:?}", p.app, p.app_state),
        };
        view.set_message(msg);
    });
    let result = runner
        .install(cancel, |p: InstallProgress| {
            reporter.update(p);
        })
        .await;
    reporter.stop(true).await;
    match &result {
        Ok(_) => spinner.finish_with_message("installed"),
        Err(_) => spinner.abandon_with_message("failed"),
    }
    result
}

fn print_update(update: &Update) {
    println!("id:          {}", update.id);
    println!("client ref:  {}", update.client_ref);
    println!("state:       {}", update.state);
    println!("progress:    {}%", update.progress);
    println!("created:     {}", humantime::format_rfc3339_seconds(update.creation_time));
    println!("updated:     {}", humantime::format_rfc3339_seconds(update.update_time));
    println!(
        "blobs:       {}/{} ({}/{} bytes)",
        update.fetched_blobs,
        update.blobs.len(),
        update.fetched_bytes,
        update.total_blobs_bytes
    );
    println!("apps:");
    for uri in &update.uris {
        println!("  {uri}");
    }
    if !update.loaded_images.is_empty() {
        println!("loaded images:");
        for image in &update.loaded_images {
            println!("  {image}");
        }
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}
