use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use saber::config::{default_settings_path, example::EXAMPLE_SETTINGS};
use saber::engine::{Interrupt, RunOptions};
use saber::galaxy::GalaxyClient;
use saber::report::{self, ReportKind};
use saber::secrets::{self, Password, SecretsError};

/// Exit status for configuration and settings-file failures.
const EXIT_CONFIG: u8 = 1;

#[derive(Parser)]
#[command(
    name = "saber",
    about = "Reliability benchmark for Galaxy servers and their compute endpoints",
    version,
    long_about = None
)]
struct Cli {
    /// Settings password, or a file holding it [env: SABER_PASSWORD]
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Settings file
    #[arg(short, long, global = true, env = "SABER_SETTINGS")]
    settings: Option<PathBuf>,

    /// Also write JSON logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `saber=trace` (defaults to RUST_LOG, then info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark every configured server and endpoint
    Run {
        /// Print the results as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Write the full HTML report (default: $HOME/saber_report_<date>.html)
        #[arg(long, value_name = "PATH", num_args = 0..=1)]
        html_report: Option<Option<PathBuf>>,

        /// Write the Markdown report (default: $HOME/saber_report_<date>.md)
        #[arg(long, value_name = "PATH", num_args = 0..=1)]
        md_report: Option<Option<PathBuf>>,

        /// Write the HTML summary table (default: $HOME/saber_summary_<date>.html)
        #[arg(long, value_name = "PATH", num_args = 0..=1)]
        table_html_report: Option<Option<PathBuf>>,

        /// Benchmark servers concurrently
        #[arg(long)]
        parallel: bool,
    },

    /// Encrypt a plain settings file in place
    Encrypt { path: PathBuf },

    /// Decrypt an encrypted settings file in place
    Decrypt { path: PathBuf },

    /// Edit an encrypted settings file with $EDITOR
    Edit { path: PathBuf },

    /// Print an annotated example settings file
    ExampleSettings,
}

/// Password for reading settings; absent is fine for plain files.
fn optional_password(explicit: Option<&str>) -> Result<Option<Password>> {
    match secrets::resolve_password(explicit) {
        Ok(password) => Ok(Some(password)),
        Err(SecretsError::MissingPassword) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn requested_reports(
    html: Option<Option<PathBuf>>,
    md: Option<Option<PathBuf>>,
    table: Option<Option<PathBuf>>,
) -> Result<Vec<(ReportKind, PathBuf)>> {
    let started = Utc::now();
    let mut reports = Vec::new();
    for (kind, choice) in [
        (ReportKind::Page, html),
        (ReportKind::Markdown, md),
        (ReportKind::Summary, table),
    ] {
        if let Some(path) = choice {
            let path = path.unwrap_or_else(|| kind.default_path(started));
            kind.validate_path(&path)?;
            reports.push((kind, path));
        }
    }
    Ok(reports)
}

async fn execute(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Run {
            json,
            html_report,
            md_report,
            table_html_report,
            parallel,
        } => {
            let reports = requested_reports(html_report, md_report, table_html_report)?;
            let settings_path = cli.settings.unwrap_or_else(default_settings_path);
            let password = optional_password(cli.password.as_deref())?;
            let config = saber::load_configuration(
                &settings_path,
                password.as_ref().map(|p| p.as_str()),
            )?;
            drop(password);

            let client = GalaxyClient::new()?;
            let options = RunOptions {
                parallel_servers: parallel,
            };
            let snapshot = saber::engine::run(&config, &client, options, Interrupt::on_ctrl_c()).await?;

            if json {
                match report::to_json(&snapshot) {
                    Ok(text) => println!("{text}"),
                    Err(e) => tracing::warn!(error = %e, "could not print results"),
                }
            }
            for (kind, path) in reports {
                if let Err(e) = report::write_report(kind, &path, &snapshot, config.date_string.as_ref()) {
                    tracing::warn!(error = %e, "the report might not have been generated");
                }
            }

            let code = snapshot.exit_code();
            tracing::info!(exit_code = code, "test completed");
            Ok(u8::try_from(code).unwrap_or(EXIT_CONFIG))
        }
        Commands::Encrypt { path } => {
            let password = secrets::resolve_password(cli.password.as_deref())?;
            secrets::encrypt_file(&path, &password)?;
            Ok(0)
        }
        Commands::Decrypt { path } => {
            let password = secrets::resolve_password(cli.password.as_deref())?;
            secrets::decrypt_file(&path, &password)?;
            Ok(0)
        }
        Commands::Edit { path } => {
            let password = secrets::resolve_password(cli.password.as_deref())?;
            secrets::edit_file(&path, &password)?;
            Ok(0)
        }
        Commands::ExampleSettings => {
            print!("{EXAMPLE_SETTINGS}");
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match saber::logging::init(cli.log_level.as_deref(), cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("saber: could not initialize logging: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
