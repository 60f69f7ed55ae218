//! Object Backup Tool
//!
//! Provides CLI interface for backing up a directory tree to S3-compatible storage

// objectbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use backup::PipelineResult;
use config::{AppConfig, create_sample_config};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use utils::format_file_size;

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    operation: Option<String>,
    config_path: PathBuf,
    output_json: Option<PathBuf>,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    match run_app().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<u8> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = parse_args(&args)?;
    let choice = match &cli.operation {
        Some(operation) => operation.clone(),
        None => prompt_choice()?,
    };

    if matches!(choice.as_str(), "4" | "init-config") {
        create_sample_config(&cli.config_path)?;
        println!(
            "✅ Sample configuration written to {}. Edit it before running a backup.",
            cli.config_path.display()
        );
        return Ok(0);
    }

    let app_config = AppConfig::load_from_json(&cli.config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config_path.display()
        )
    })?;
    utils::logger::init(&app_config.logging.level, app_config.logging.json)
        .context("Failed to initialize logging")?;

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            run_and_report(&app_config, false, cli.output_json.as_ref()).await
        }
        "2" | "dry-run" => {
            println!("🔍 Starting Dry Run (nothing is uploaded or deleted)...");
            run_and_report(&app_config, true, cli.output_json.as_ref()).await
        }
        "3" | "status" => {
            println!("📋 Source directory: {}", app_config.backup.source_dir.display());
            println!("🪣 Bucket: {}", app_config.storage.bucket_name);
            println!("🗑 Delete after upload: {}", app_config.backup.delete_after_upload);
            backup::check_status(&app_config).await?;
            println!("✅ Object store is reachable.");
            Ok(0)
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter '1' (backup), '2' (dry-run), '3' (status) or '4' (init-config)."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
}

async fn run_and_report(
    app_config: &AppConfig,
    dry_run: bool,
    output_json: Option<&PathBuf>,
) -> Result<u8> {
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️ Interrupt received, letting in-flight uploads finish...");
            signal_token.cancel();
        }
    });

    let result = backup::run_backup_flow(app_config, dry_run, cancel)
        .await
        .context("Backup process failed")?;
    print_summary(&result);

    if let Some(path) = output_json {
        let content = serde_json::to_string_pretty(&result)
            .context("Failed to serialize backup result")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write backup result to {}", path.display()))?;
        println!("💾 Result saved to {}", path.display());
    }

    Ok(backup::exit_code(result.classification))
}

fn print_summary(result: &PipelineResult) {
    println!();
    println!("📊 Backup summary ({})", result.run_id);
    println!("   Outcome:        {}", result.classification.as_str());
    println!("   Files found:    {}", result.total_files);
    if result.simulated {
        println!("   Would upload:   {}", result.skipped_dry_run);
    } else {
        println!(
            "   Uploaded:       {} ({})",
            result.successful_uploads,
            format_file_size(result.uploaded_bytes)
        );
    }
    println!("   Failed:         {}", result.failed_uploads);
    if result.not_attempted > 0 {
        println!("   Not attempted:  {}", result.not_attempted);
    }
    println!("   Deleted:        {}", result.deleted_files);
    if result.deletions_not_attempted > 0 {
        println!("   Not deleted:    {} (interrupted)", result.deletions_not_attempted);
    }
    println!("   Success rate:   {:.1}%", result.success_rate_percent);
    println!("   Duration:       {:.2}s", result.duration_seconds);

    for (path, error) in &result.upload_errors {
        eprintln!("   ❌ {}: {}", path, error);
    }
    for (path, error) in &result.deletion_errors {
        eprintln!("   ⚠️ kept {}: {}", path, error);
    }
    if let Some(manifest) = &result.manifest {
        println!("   Manifest:       {}", manifest);
    }
    if let Some(fatal) = &result.fatal_error {
        eprintln!("   ❌ {}", fatal);
    }
}

/// `[operation] [--config PATH] [--output-json PATH]`, in any order.
fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut cli = CliArgs {
        operation: None,
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        output_json: None,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().context("--config requires a path")?;
                cli.config_path = PathBuf::from(value);
            }
            "--output-json" => {
                let value = iter.next().context("--output-json requires a path")?;
                cli.output_json = Some(PathBuf::from(value));
            }
            flag if flag.starts_with("--") => anyhow::bail!("Unknown option: {}", flag),
            operation => {
                if cli.operation.is_some() {
                    anyhow::bail!("Only one operation may be given, got '{}' as well", operation);
                }
                cli.operation = Some(operation.trim().to_string());
            }
        }
    }
    Ok(cli)
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run Backup (or type 'backup')");
    println!("2. Dry Run (or type 'dry-run')");
    println!("3. Check Status (or type 'status')");
    println!("4. Create Sample Config (or type 'init-config')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
