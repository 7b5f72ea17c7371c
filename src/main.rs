use anyhow::{bail, Context, Result};
use clap::Parser;
use silverstage::{
    config::PipelineConfig,
    entity::Entity,
    pipeline,
    secrets::{Credentials, EnvSecretStore},
};
use std::{fs, path::PathBuf, sync::Arc, time::Instant};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bronze to Silver transformation stage for the AdventureWorks extracts"
)]
struct Args {
    /// YAML pipeline configuration. CLI flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated entities to run (default: all)
    #[arg(short, long, value_delimiter = ',')]
    entities: Vec<String>,

    /// Filesystem root of the bronze zone
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Filesystem root of the silver zone
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Secret-store scope holding the OAuth client credentials
    #[arg(long)]
    secret_scope: Option<String>,

    /// Storage account named in locators
    #[arg(long)]
    account: Option<String>,

    /// Max entities running at once
    #[arg(short, long)]
    workers: Option<usize>,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let (Some(account), Some(src), Some(out), Some(scope)) = (
                &args.account,
                &args.source_root,
                &args.output_root,
                &args.secret_scope,
            ) else {
                bail!("without --config, --account, --source-root, --output-root and --secret-scope are required");
            };
            PipelineConfig::new(account, src, out, scope)
        }
    };

    if let Some(account) = &args.account {
        cfg.account = account.clone();
    }
    if let Some(src) = &args.source_root {
        cfg.source_root = src.clone();
    }
    if let Some(out) = &args.output_root {
        cfg.output_root = out.clone();
    }
    if let Some(scope) = &args.secret_scope {
        cfg.secret_scope = scope.clone();
    }
    if let Some(w) = args.workers {
        cfg.workers = w;
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn selected_entities(names: &[String]) -> Result<Vec<Entity>> {
    if names.is_empty() {
        return Ok(Entity::ALL.to_vec());
    }
    names
        .iter()
        .map(|n| Entity::from_name(n).with_context(|| format!("unknown entity `{}`", n)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let cfg = build_config(&args)?;
    let entities = selected_entities(&args.entities)?;
    info!(
        account = %cfg.account,
        source = %cfg.source_root.display(),
        output = %cfg.output_root.display(),
        workers = cfg.workers,
        "startup"
    );

    // credentials are held for the run; filesystem-backed zones never send them
    let _credentials = Credentials::fetch(&EnvSecretStore, &cfg.secret_scope)
        .with_context(|| format!("fetching credentials from scope `{}`", cfg.secret_scope))?;
    info!(scope = %cfg.secret_scope, "credentials loaded");

    let start = Instant::now();
    let report = pipeline::run(Arc::new(cfg), &entities).await;

    for done in &report.succeeded {
        info!(
            entity = %done.entity,
            rows = done.rows,
            output = %done.output,
            warnings = done.warnings.len(),
            "ok"
        );
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    if !report.is_success() {
        let failed: Vec<String> = report
            .failed_entities()
            .iter()
            .map(|e| e.to_string())
            .collect();
        error!(failed = ?failed, elapsed = ?start.elapsed(), "run finished with failures");
        std::process::exit(1);
    }
    info!(elapsed = ?start.elapsed(), "all done");
    Ok(())
}
