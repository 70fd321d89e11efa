use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cardiocam_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use cardiocam_core::engine::{InferenceEngine, PredictOptions};
use cardiocam_core::labels::ChdClass;
use cardiocam_core::logging::{self, LogSettings, RunMode, FALLBACK_FILTER};
use cardiocam_core::model::weights;
use cardiocam_core::preprocess::decode_image;
use cardiocam_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "cardiocam",
    about = "Congenital heart disease screening from chest X-rays with Grad-CAM overlays",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(
        long = "model",
        value_name = "PATH",
        global = true,
        help = "Weights artifact (overrides CARDIOCAM_MODEL_PATH and config)"
    )]
    model: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one image and print the result as JSON.
    Predict(PredictArgs),
    /// Print the structure of an ONNX weights artifact as JSON.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct PredictArgs {
    #[arg(help = "Chest X-ray image (PNG, JPEG, BMP, TIFF or WebP)")]
    image: PathBuf,
    #[arg(long, help = "Skip Grad-CAM localization")]
    no_explain: bool,
    #[arg(long, value_name = "PATH", help = "Write the heatmap overlay PNG here")]
    overlay_out: Option<PathBuf>,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(help = "Path to an ONNX file")]
    model: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match &cli.command {
        Some(Commands::Predict(_)) => RunMode::Predict,
        Some(Commands::Inspect(_)) => RunMode::Inspect,
        None => RunMode::Server,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    cardiocam_core::runtime::setup_runtime_libs();
    // Logging follows the config when it parses; a bad config is reported
    // once logging is up and then aborts every model-backed command.
    let config = load_config(&resolved_data_dir, cli.model.as_deref());
    let server_config = config
        .as_ref()
        .map(|config| config.server.clone())
        .unwrap_or_default();
    let settings = LogSettings::new(mode, &resolved_data_dir, &server_config)
        .with_verbosity(cli.verbose)
        .with_flag_filter(cli.log_filter.as_deref())
        .with_env_filter(std::env::var("RUST_LOG").ok());
    init_logging(&settings);
    cardiocam_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Inspect(args)) => run_inspect(args),
        Some(Commands::Predict(args)) => run_predict(args, config?, &resolved_data_dir).await,
        None => run_server(cli.port, cli.host, config?, resolved_data_dir).await,
    }
}

fn init_logging(settings: &LogSettings) {
    let hook = logging::install_crash_hook(&settings.crash_dir());
    let (appender, sink_error) = match settings.open_file_sink() {
        Ok(appender) => (Some(appender), None),
        Err(error) => (None, Some(error)),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&settings.console_filter(), "console"));
    let file_layer = appender.map(|appender| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
            .with_filter(parse_env_filter_with_fallback(&settings.file_filter(), "file"))
    });

    if let Err(error) = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }

    if let Some(error) = sink_error {
        warn!(%error, "Persistent file logging unavailable; console only");
    }
    if let Err(error) = hook {
        warn!(%error, "Crash reports disabled");
    }
    logging::record_crash_context("mode", settings.mode.name());
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{FALLBACK_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(FALLBACK_FILTER)
    })
}

fn log_startup_metadata(mode: RunMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Read `config.toml` (created with defaults on first run) and apply the
/// weights path override. Malformed or invalid files are `ChdError::Config`.
fn load_config(data_dir: &Path, model_override: Option<&Path>) -> Result<AppConfig> {
    initialize_data_dir(data_dir)?;
    let mut config = AppConfig::load_validated(&config_path(data_dir))?;
    config.apply_model_override(model_override);
    Ok(config)
}

fn load_engine(config: &AppConfig, data_dir: &Path) -> Result<InferenceEngine> {
    let model_path = config.model_path(data_dir);
    let engine = InferenceEngine::load(config, data_dir)
        .with_context(|| format!("failed to load model from {}", model_path.display()))?;

    let summary = engine.summary();
    logging::record_crash_context("model.path", model_path.display().to_string());
    logging::record_crash_context("model.backbone", summary.backbone.name());
    logging::record_crash_context("model.weights_sha256", summary.weights_sha256.clone());
    logging::record_crash_context("model.preprocessing", summary.preprocessing);
    Ok(engine)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: PathBuf,
) -> Result<()> {
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let engine = tokio::task::spawn_blocking(move || load_engine(&config, &data_dir))
        .await
        .context("model loading task failed")??;
    let app = app_router(AppState::new(engine));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting cardiocam server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_predict(args: PredictArgs, config: AppConfig, data_dir: &Path) -> Result<()> {
    logging::record_crash_context("predict.image", args.image.display().to_string());
    let bytes = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("failed to read image: {}", args.image.display()))?;

    let data_dir = data_dir.to_path_buf();
    let options = PredictOptions {
        explain: !args.no_explain && config.explain.enabled,
    };
    let record = tokio::task::spawn_blocking(move || -> Result<_> {
        let engine = load_engine(&config, &data_dir)?;
        let image = decode_image(&bytes)?;
        Ok(engine.predict_with(&image, options)?)
    })
    .await
    .context("prediction task failed")??;

    let mut overlay_path = None;
    match (&args.overlay_out, &record.overlay) {
        (Some(path), Some(overlay)) => {
            tokio::fs::write(path, overlay.png())
                .await
                .with_context(|| format!("failed to write overlay: {}", path.display()))?;
            overlay_path = Some(path.display().to_string());
        }
        (Some(path), None) => {
            warn!(path = %path.display(), "No overlay produced; nothing written");
        }
        _ => {}
    }

    let probabilities: BTreeMap<&str, f64> = ChdClass::ALL
        .iter()
        .map(|class| (class.as_str(), f64::from(record.probabilities.get(*class))))
        .collect();
    let summary = serde_json::json!({
        "image": args.image.display().to_string(),
        "label": record.label,
        "confidence": record.confidence,
        "probabilities": probabilities,
        "overlay": overlay_path,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let inspection = weights::inspect(&args.model)?;
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}
