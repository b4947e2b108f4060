use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;
use static_render::{
    BuildOutput, Diagnostic, DiagnosticLevel, HostModules, RenderConfig, RenderHandle,
    RenderPlugin,
};
use tracing_subscriber::EnvFilter;

/// Render every configured route of an emitted render build to static HTML.
#[derive(Debug, Parser)]
#[command(name = "static-render", version)]
struct Cli {
    /// JSON configuration file (camelCase keys)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the emitted render bundle
    #[arg(long = "render-dir")]
    render_dir: PathBuf,

    /// Additional asset producer to wait for, as NAME=DIR
    #[arg(long = "assets", value_name = "NAME=DIR")]
    assets: Vec<String>,

    /// Output directory, overriding `renderDirectory`
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Host module made available to `require`, as NAME=FILE
    #[arg(long = "external", value_name = "NAME=FILE")]
    externals: Vec<String>,

    /// Log progress at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("[static-render] {err:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read config '{}'", path.display()))?;
            RenderConfig::from_json(&json)?
        }
        None => RenderConfig::default(),
    };
    if let Some(out) = &cli.out {
        config.render_directory = out.clone();
    }
    config.verbose |= cli.verbose;

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut externals = HostModules::new();
    for spec in &cli.externals {
        let (name, file) = split_pair(spec)?;
        let source = fs::read_to_string(file)
            .with_context(|| format!("failed to read external module '{file}'"))?;
        externals = externals.with_source(name, source);
    }
    if !externals.is_empty() {
        tracing::debug!("Loaded {} external modules", externals.len());
    }

    let assets = cli
        .assets
        .iter()
        .map(|spec| split_pair(spec).map(|(name, dir)| (name.to_string(), PathBuf::from(dir))))
        .collect::<Result<Vec<_>>>()?;

    let renderer_name = config.renderer_name.clone();
    let mut plugin = RenderPlugin::new(config).with_externals(externals);
    for (name, _) in &assets {
        plugin = plugin.producer(name.as_str());
    }
    plugin = plugin.producer(renderer_name.as_str());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        let (service, handle) = plugin.build()?;
        let (_, result) = tokio::join!(
            service.run(),
            drive(handle, assets, renderer_name, cli.render_dir)
        );
        result
    })
}

/// Feed each producer's emitted directory through the build hooks.
async fn drive(
    handle: RenderHandle,
    assets: Vec<(String, PathBuf)>,
    renderer_name: String,
    render_dir: PathBuf,
) -> Result<()> {
    let mut diagnostics = Vec::new();
    for (name, dir) in assets {
        let output = BuildOutput::from_dir(&dir)
            .await
            .with_context(|| format!("failed to read {name} output '{}'", dir.display()))?;
        diagnostics.extend(handle.run_build(&name, output).await?);
    }

    let output = BuildOutput::from_dir(&render_dir)
        .await
        .with_context(|| format!("failed to read render output '{}'", render_dir.display()))?;
    diagnostics.extend(handle.run_build(&renderer_name, output).await?);

    report(&diagnostics)
}

fn report(diagnostics: &[Diagnostic]) -> Result<()> {
    let mut errors = 0;
    for diagnostic in diagnostics {
        match diagnostic.level {
            DiagnosticLevel::Error => {
                errors += 1;
                tracing::error!("{}", diagnostic.message);
            }
            DiagnosticLevel::Warning => tracing::warn!("{}", diagnostic.message),
            DiagnosticLevel::Info => tracing::info!("{}", diagnostic.message),
        }
    }
    if errors > 0 {
        bail!("render failed with {errors} error(s)");
    }
    Ok(())
}

fn split_pair(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => Ok((name, value)),
        _ => bail!("expected NAME=VALUE, got '{spec}'"),
    }
}
