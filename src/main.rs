use std::path::PathBuf;
use std::time::Duration;

use imagemill_core::engine::{CommandCompiler, Operation};
use imagemill_core::settings::{default_app_root, load_settings};
use imagemill_core::worker::WorkerConfig;
use imagemill_core::AppComponents;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let rest = cli_args.iter().skip(1).cloned().collect::<Vec<_>>();
    match cli_args.first().map(String::as_str) {
        Some("worker") => run_worker_cli(rest).await,
        Some("reconcile") => run_reconcile_cli(rest).await,
        Some("validate-command") => run_validate_command_cli(rest),
        Some("preview-command") => run_preview_command_cli(rest),
        Some("queue-stats") => run_queue_stats_cli(rest).await,
        Some("-h" | "--help") | None => {
            print_usage();
            Ok(())
        }
        Some(unknown) => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

fn print_usage() {
    println!(
        "Usage: imagemill-core <command> [options]\n\n\
         Commands:\n  \
         worker [--concurrency N] [--poll-ms MS] [--once]\n  \
         reconcile [--job-id ID]\n  \
         validate-command --command TEXT\n  \
         preview-command --operations-json JSON [--output-format FMT] [--quality Q]\n  \
         queue-stats\n\n\
         Every command also accepts --app-root PATH and --settings PATH."
    );
}

/// Flags shared by every command, plus whatever the command itself takes.
#[derive(Debug, Default)]
struct CliArgs {
    app_root: Option<PathBuf>,
    settings_path: Option<String>,
    values: Vec<(String, String)>,
    switches: Vec<String>,
}

impl CliArgs {
    fn value(&self, flag: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(name, _)| name == flag)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, flag: &str) -> Result<&str, Box<dyn std::error::Error>> {
        self.value(flag)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
    }

    fn switch(&self, flag: &str) -> bool {
        self.switches.iter().any(|name| name == flag)
    }

    fn parsed<T: std::str::FromStr>(&self, flag: &str) -> Result<Option<T>, Box<dyn std::error::Error>> {
        match self.value(flag) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| std::io::Error::other(format!("Invalid value for {flag}: {raw}")).into()),
            None => Ok(None),
        }
    }
}

fn parse_cli_args(
    args: &[String],
    value_flags: &[&str],
    switch_flags: &[&str],
) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let mut parsed = CliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                parsed.app_root = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--settings" => {
                parsed.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            known if value_flags.contains(&known) => {
                parsed.values.push((known.to_string(), needs_value(i)?));
                i += 2;
            }
            known if switch_flags.contains(&known) => {
                parsed.switches.push(known.to_string());
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }
    Ok(parsed)
}

fn load_components(args: &CliArgs) -> Result<AppComponents, Box<dyn std::error::Error>> {
    let app_root = args.app_root.clone().unwrap_or_else(default_app_root);
    let settings = load_settings(app_root.as_path(), args.settings_path.as_deref())?;
    Ok(AppComponents::from_settings(settings)?)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
    }
}

async fn run_worker_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args(&args, &["--concurrency", "--poll-ms"], &["--once"])?;
    let components = load_components(&args)?;

    let defaults = components.worker_config();
    let config = WorkerConfig {
        concurrency: args.parsed::<usize>("--concurrency")?.unwrap_or(defaults.concurrency),
        poll_interval: args
            .parsed::<u64>("--poll-ms")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
    };
    let worker = components.worker(config);

    let purged = components.queue.purge_expired().await?;
    if purged > 0 {
        info!(purged, "dropped expired queue records");
    }

    let summary = if args.switch("--once") {
        worker.run_once().await?
    } else {
        worker.run_until(shutdown_signal()).await?
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "finished": summary.finished,
            "failed": summary.failed,
            "abandoned": summary.abandoned,
        }))?
    );
    Ok(())
}

async fn run_reconcile_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args(&args, &["--job-id"], &[])?;
    let components = load_components(&args)?;

    match args.value("--job-id") {
        Some(job_id) => {
            let job = components.service.job_status(job_id.trim()).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        None => {
            let summary = components.reconciler.reconcile_active().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "examined": summary.examined,
                    "changed": summary.changed,
                    "errors": summary.errors,
                }))?
            );
        }
    }
    Ok(())
}

fn run_validate_command_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args(&args, &["--command"], &[])?;
    let command = args.required("--command")?;
    let verdict = match CommandCompiler::check_raw(command) {
        Ok(tokens) => json!({ "valid": true, "tokens": tokens }),
        Err(error) => json!({ "valid": false, "error": error.to_string() }),
    };
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn run_preview_command_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args(
        &args,
        &["--operations-json", "--output-format", "--quality"],
        &[],
    )?;
    let operations: Vec<Operation> = serde_json::from_str(args.required("--operations-json")?)?;
    let quality = args.parsed::<u8>("--quality")?;
    let components = load_components(&args)?;
    let preview =
        components
            .service
            .preview_command(&operations, args.value("--output-format"), quality);
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

async fn run_queue_stats_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args(&args, &[], &[])?;
    let components = load_components(&args)?;
    let stats = components.service.queue_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
