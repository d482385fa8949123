//! koe-bot: entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI arguments
//!   3. Load config
//!   4. Resolve effective log level (CLI `-v` flags > env > config)
//!   5. Init logger once
//!   6. Dispatch the command (`run` serves until Ctrl-C or console EOF)

use tracing::info;

use koe_bot::cli::{self, Command};
use koe_bot::training::PretrainOutcome;
use koe_bot::{app, config, error, logger};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), error::AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = cli::parse(std::env::args().skip(1))?;
    if args.command == Command::Help {
        println!("{}", cli::USAGE);
        return Ok(());
    }

    let config = config::load(args.config_path.as_deref())?;

    let cli_level = logger::verbosity_level(args.verbosity);
    let effective_log_level = cli_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, cli_level.is_some(), config.log_file.as_deref())?;

    info!(
        bot_name = %config.bot_name,
        work_dir = %config.work_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    match args.command {
        Command::Run | Command::Help => app::run(config).await,
        Command::Collect => {
            let written = tokio::task::spawn_blocking(move || app::collect(&config))
                .await
                .map_err(|e| error::AppError::Task(format!("collect: {e}")))??;
            println!("✓ collected {} source file(s)", written.len());
            Ok(())
        }
        Command::Learn { dir } => {
            let version = tokio::task::spawn_blocking(move || app::learn(&config, dir.as_deref()))
                .await
                .map_err(|e| error::AppError::Task(format!("learn: {e}")))??;
            println!("✓ fine-tuned model {version} is now served");
            Ok(())
        }
        Command::Pretrain { files, preamble, force } => {
            let outcome = tokio::task::spawn_blocking(move || {
                app::pretrain(&config, &files, preamble.as_deref(), force)
            })
            .await
            .map_err(|e| error::AppError::Task(format!("pretrain: {e}")))??;
            match outcome {
                PretrainOutcome::Skipped(path) => {
                    println!("base model already exists at {} (use --force to retrain)", path.display())
                }
                PretrainOutcome::Written { path, examples } => {
                    println!("✓ base model written to {} ({examples} examples)", path.display())
                }
            }
            Ok(())
        }
    }
}
