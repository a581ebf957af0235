mod commands;
mod interrupt;
mod logging;
mod progress;

use std::path::Path;
use std::process;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use progress::CliReporter;
use strongbox_core::{
    AppConfig, BackupFolder, BackupResult, BackupTask, CancelToken, CatalogReader,
    RestoreTask, ValidationState, ValidationTask,
};
use tracing::{error, info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match strongbox_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let cancel = CancelToken::new();
    if let Err(err) = interrupt::cancel_on_interrupt(&cancel) {
        warn!("Ctrl-C will not cancel this run: {}", err);
    }

    let outcome = match args.command {
        Some(Commands::Backup) => run_backup(&config, &cancel),
        Some(Commands::List) => run_list(&config),
        Some(Commands::Browse { catalog, folder }) => run_browse(&config, &catalog, folder),
        Some(Commands::Restore {
            catalog,
            target,
            folder,
        }) => run_restore(&config, &catalog, &target, folder, &cancel),
        Some(Commands::Validate) => run_validate(&config, &cancel),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = outcome {
        error!("Error: {}", err);
        process::exit(1);
    }
    Ok(())
}

fn run_backup(config: &AppConfig, cancel: &CancelToken) -> Result<(), Box<dyn std::error::Error>> {
    let task = BackupTask::from_config(config)?;
    let reporter = CliReporter::new();
    let outcome = task.run(cancel, &reporter);

    println!();
    let result = format!("{:?}", outcome.result);
    info!(
        "Backup {} in {}",
        match outcome.result {
            BackupResult::Successful => result.green(),
            BackupResult::Canceled => result.yellow(),
            _ => result.red(),
        },
        format!("{:.2}s", outcome.duration.as_secs_f64()).green(),
    );
    info!(
        "{} files processed, {} new blobs, {} file errors",
        format!("{}", outcome.processed_files).cyan(),
        format!("{}", outcome.added_blobs).cyan(),
        format!("{}", outcome.file_errors.len()).red(),
    );
    if let Some(name) = &outcome.catalog_name {
        info!("Catalog {}", name.cyan());
    }
    for mismatch in &outcome.validation_errors {
        warn!("Catalog mismatch: {}", mismatch);
    }
    match outcome.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_list(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let catalogs = strongbox_core::list_catalogs(config.destination()?)?;
    if catalogs.is_empty() {
        println!("No catalogs at {}", config.destination()?.display());
    }
    for catalog in catalogs {
        println!(
            "{}  {}",
            catalog.created.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            catalog.name.cyan()
        );
    }
    Ok(())
}

fn open_catalog(config: &AppConfig, catalog: &str) -> Result<CatalogReader, Box<dyn std::error::Error>> {
    let path = config.destination()?.join(catalog);
    if !path.is_file() {
        return Err(format!("catalog {} not found", path.display()).into());
    }
    Ok(CatalogReader::with_idle_timeout(&path, config.reader_idle()))
}

fn select_folder(
    reader: &CatalogReader,
    folder: Option<i64>,
) -> Result<BackupFolder, Box<dyn std::error::Error>> {
    match folder {
        Some(id) => BackupFolder::find(reader, id)?
            .ok_or_else(|| format!("no folder {} in catalog", id).into()),
        None => Ok(BackupFolder::catalog_root(reader)),
    }
}

fn run_browse(
    config: &AppConfig,
    catalog: &str,
    folder: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader = open_catalog(config, catalog)?;
    let mut node = select_folder(&reader, folder)?;

    println!("{}", node.name.bold());
    for child in node.load_folders(&reader)? {
        let id = child.id.map(|id| id.to_string()).unwrap_or_default();
        println!("  {:>6}  {}/", id.dimmed(), child.name.blue());
    }
    for file in node.load_files(&reader)? {
        println!("          {}  {}", file.name, file.stored_name.dimmed());
    }
    Ok(())
}

fn run_restore(
    config: &AppConfig,
    catalog: &str,
    target: &Path,
    folder: Option<i64>,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader = open_catalog(config, catalog)?;
    let mut node = select_folder(&reader, folder)?;
    let reporter = CliReporter::new();

    let report = RestoreTask::new(config.destination()?, &reader).run(
        &mut node,
        target,
        cancel,
        &reporter,
    )?;

    println!();
    info!(
        "Restored {} of {} files in {}, {} errors",
        format!("{}", report.restored_files).green(),
        report.total_files,
        format!("{:.2}s", report.duration.as_secs_f64()).green(),
        format!("{}", report.errors.len()).red(),
    );
    Ok(())
}

fn run_validate(config: &AppConfig, cancel: &CancelToken) -> Result<(), Box<dyn std::error::Error>> {
    let reporter = CliReporter::new();
    let report = ValidationTask::new(config.destination()?).run(cancel, &reporter);

    println!();
    info!(
        "Validation {:?}: {} catalogs, {} blobs checked in {}",
        report.state,
        report.catalogs,
        report.checked_files,
        format!("{:.2}s", report.duration.as_secs_f64()).green(),
    );
    info!(
        "{} error files, {} unused blobs ({} deleted)",
        format!("{}", report.error_files.len()).red(),
        format!("{}", report.unused_files).yellow(),
        report.deleted_files,
    );
    for file in &report.error_files {
        warn!("{}: {}", file.stored_name, file.problem);
        for claim in &file.claims {
            warn!(
                "  catalog hash {} in {}, live {}",
                claim.hash,
                claim.catalogs.join(", "),
                file.live_hash.as_deref().unwrap_or("-")
            );
        }
    }
    match (report.state, report.error) {
        (ValidationState::Failed, Some(err)) => Err(err.into()),
        _ => Ok(()),
    }
}
