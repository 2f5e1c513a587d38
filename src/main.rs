//! `gletscher`: incremental, encrypted, deduplicating backup to Amazon
//! Glacier. This binary owns argument parsing, the on-disk configuration
//! format, directory scanning and process logging; all four CORE
//! subsystems (chunk store, tree-hash, streaming uploader, index/catalog)
//! live in `gletscher-core`.

mod cli;
mod commands;
mod config;
mod scanner;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    if let Command::Init = cli.command {
        // Nothing to log to yet: the config directory (and therefore
        // log.txt) doesn't exist until `init` creates it.
        init_log(&cli.config_dir, verbose, /* to_file = */ false);
        return run_to_exit_code(commands::init::run(&cli.config_dir));
    }

    let config = match Config::load(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            init_log(&cli.config_dir, verbose, false);
            log::error!("loading config: {:#}", e);
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };
    init_log(&cli.config_dir, verbose, true);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(dispatch(&config, cli.command));
    run_to_exit_code(result)
}

async fn dispatch(config: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init => unreachable!("handled before config load"),
        Command::Backup {
            catalog,
            directories,
            excludes,
        } => commands::backup::run(config, &catalog, &directories, &excludes).await,
        Command::UploadCatalog => commands::upload_catalog::run(config).await,
        Command::Reconcile {
            poll_interval_secs,
            max_wait_secs,
        } => commands::reconcile::run(config, poll_interval_secs, max_wait_secs).await,
        Command::Restore {
            catalog,
            patterns,
            output_dir,
        } => commands::restore::run(config, &catalog, &patterns, &output_dir).await,
        Command::GlacierListJobs => commands::glacier_jobs::list_jobs(config).await,
        Command::GlacierRetrieveJobOutput { job_id, output_file } => {
            commands::glacier_jobs::retrieve_job_output(config, &job_id, &output_file).await
        }
        Command::SearchCatalog { catalog, patterns } => {
            commands::search_catalog::run(config, &catalog, &patterns)
        }
    }
}

/// Set up the `fern` dispatcher: `log.txt` inside the config directory
/// always gets `debug` and above; stderr mirrors at a level raised by
/// `-v`/`-vv`.
fn init_log(config_dir: &std::path::Path, verbose: u8, to_file: bool) {
    let stderr_level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Trace)
        .chain(fern::Dispatch::new().level(stderr_level).chain(std::io::stderr()));

    if to_file {
        if let Ok(log_file) = fern::log_file(config_dir.join("log.txt")) {
            dispatch = dispatch.chain(fern::Dispatch::new().level(log::LevelFilter::Debug).chain(log_file));
        }
    }

    let _ = dispatch.apply();
}

/// Map a command's outcome onto the process exit code the CLI surface
/// promises: 0 success, 1 usage/precondition failure, 2 integrity failure,
/// 3 remote/transport failure after retries.
fn run_to_exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(core_err) = err.downcast_ref::<gletscher_core::Error>() {
        return match core_err {
            gletscher_core::Error::DataMissing(_)
            | gletscher_core::Error::TreeHashMismatch
            | gletscher_core::Error::IntegrityFailure(_) => 2,
            gletscher_core::Error::Http(_) | gletscher_core::Error::RemoteRejection { .. } => 3,
            _ => 1,
        };
    }
    1
}
