//! Route render driver.
//!
//! Calls the live renderer once per route and hands each result to the
//! output file system. Serial mode renders one route at a time and stops at
//! the first failure. Parallel mode dispatches every render before awaiting
//! any of them, attempts all routes, and fails with the aggregate if any
//! route failed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::{RenderConcurrency, RenderConfig, Route};
use crate::evaluator::{ModuleEvaluator, ModuleHandle, RenderValue};
use crate::output::{DiskFileSystem, OutputFileSystem};
use crate::stats::BuildStats;
use crate::RenderError;

/// Caller supplied `(route, stats) -> params`, merged over the route fields.
pub type MapStatsToParams =
    Arc<dyn Fn(&Route, &BuildStats) -> serde_json::Map<String, serde_json::Value> + Send + Sync>;

/// Caller supplied `route -> relative output path`.
pub type TransformFilePath = Arc<dyn Fn(&Route) -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RenderSettings {
    /// Absolute output root.
    pub render_directory: PathBuf,
    pub concurrency: RenderConcurrency,
    pub write_error_pages: bool,
    pub map_stats_to_params: MapStatsToParams,
    pub transform_file_path: TransformFilePath,
    pub fs: Arc<dyn OutputFileSystem>,
}

impl fmt::Debug for RenderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSettings")
            .field("render_directory", &self.render_directory)
            .field("concurrency", &self.concurrency)
            .field("write_error_pages", &self.write_error_pages)
            .finish()
    }
}

pub fn default_map_stats_to_params() -> MapStatsToParams {
    Arc::new(|_, _| serde_json::Map::new())
}

pub fn default_transform_file_path() -> TransformFilePath {
    Arc::new(|route| route.route.clone())
}

impl RenderSettings {
    /// Settings with default callables and the disk file system.
    pub fn from_config(config: &RenderConfig) -> std::io::Result<Self> {
        Ok(Self {
            render_directory: config.absolute_render_directory()?,
            concurrency: config.render_concurrency,
            write_error_pages: config.write_error_pages,
            map_stats_to_params: default_map_stats_to_params(),
            transform_file_path: default_transform_file_path(),
            fs: Arc::new(DiskFileSystem),
        })
    }

    /// Where a route's HTML is written.
    pub fn file_path(&self, route: &Route) -> PathBuf {
        output_path(&self.render_directory, &(self.transform_file_path)(route))
    }

    /// Route fields shallow-merged with the stats mapping; mapping keys win.
    pub fn params(&self, route: &Route, stats: &BuildStats) -> serde_json::Value {
        let mut params = route.to_params();
        params.extend((self.map_stats_to_params)(route, stats));
        serde_json::Value::Object(params)
    }
}

/// Derive the output file for a route's relative path.
///
/// A path ending in `.html` is used as is; anything else gets `index.html`
/// appended. Leading separators are stripped so the path is taken relative
/// to the render directory. Other segments, `..` included, are joined as
/// given: a path transform may deliberately write outside the directory.
pub fn output_path(render_directory: &Path, relative: &str) -> PathBuf {
    let relative = relative.trim_start_matches(['/', '\\']);
    if relative.ends_with(".html") {
        render_directory.join(relative)
    } else {
        render_directory.join(relative).join("index.html")
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Render every route and write the results. Returns the written files.
pub async fn render_all(
    evaluator: &mut ModuleEvaluator,
    renderer: &ModuleHandle,
    routes: &[Route],
    stats: &BuildStats,
    settings: &RenderSettings,
) -> Result<Vec<PathBuf>, RenderError> {
    tracing::info!(
        "Starting render of {} routes ({:?})",
        routes.len(),
        settings.concurrency
    );
    match settings.concurrency {
        RenderConcurrency::Serial => render_serial(evaluator, renderer, routes, stats, settings).await,
        RenderConcurrency::Parallel => {
            render_parallel(evaluator, renderer, routes, stats, settings).await
        }
    }
}

/// Render a single route and write it.
pub async fn render_route(
    evaluator: &mut ModuleEvaluator,
    renderer: &ModuleHandle,
    route: &Route,
    stats: &BuildStats,
    settings: &RenderSettings,
) -> Result<PathBuf, RenderError> {
    let file = settings.file_path(route);
    let params = settings.params(route, stats);
    tracing::debug!("Starting render of \"{}\"", route.route);

    let outcome = match evaluator.dispatch(renderer, &params) {
        Ok(pending) => evaluator.settle(pending).await,
        Err(err) => Err(err),
    };
    finish(route.clone(), file, outcome, stats.clone(), settings.clone()).await
}

async fn render_serial(
    evaluator: &mut ModuleEvaluator,
    renderer: &ModuleHandle,
    routes: &[Route],
    stats: &BuildStats,
    settings: &RenderSettings,
) -> Result<Vec<PathBuf>, RenderError> {
    let mut written = Vec::with_capacity(routes.len());
    for route in routes {
        written.push(render_route(evaluator, renderer, route, stats, settings).await?);
    }
    Ok(written)
}

async fn render_parallel(
    evaluator: &mut ModuleEvaluator,
    renderer: &ModuleHandle,
    routes: &[Route],
    stats: &BuildStats,
    settings: &RenderSettings,
) -> Result<Vec<PathBuf>, RenderError> {
    // Start every render before awaiting any so they share the event loop.
    let dispatched: Vec<_> = routes
        .iter()
        .map(|route| {
            let params = settings.params(route, stats);
            evaluator.dispatch(renderer, &params)
        })
        .collect();

    let mut writes = JoinSet::new();
    for (index, (route, pending)) in routes.iter().zip(dispatched).enumerate() {
        let outcome = match pending {
            Ok(pending) => evaluator.settle(pending).await,
            Err(err) => Err(err),
        };
        let file = settings.file_path(route);
        let task = finish(route.clone(), file, outcome, stats.clone(), settings.clone());
        writes.spawn(async move { (index, task.await) });
    }

    let mut results: Vec<Option<Result<PathBuf, RenderError>>> =
        (0..routes.len()).map(|_| None).collect();
    while let Some(joined) = writes.join_next().await {
        let (index, result) = joined.map_err(|e| RenderError::Io(std::io::Error::other(e)))?;
        results[index] = Some(result);
    }

    let mut written = Vec::with_capacity(routes.len());
    let mut failures = Vec::new();
    for result in results.into_iter().flatten() {
        match result {
            Ok(path) => written.push(path),
            Err(err) => failures.push(err),
        }
    }

    match failures.len() {
        0 => Ok(written),
        1 => Err(failures.remove(0)),
        _ => Err(RenderError::Aggregate(failures)),
    }
}

/// Validate one settled render and write its output.
async fn finish(
    route: Route,
    file: PathBuf,
    outcome: Result<RenderValue, RenderError>,
    stats: BuildStats,
    settings: RenderSettings,
) -> Result<PathBuf, RenderError> {
    match outcome {
        Ok(RenderValue {
            value: Some(html), ..
        }) => {
            write_output(settings.fs.as_ref(), &file, &html).await?;
            tracing::debug!("Successfully emitted {}", file.display());
            Ok(file)
        }
        Ok(RenderValue { kind, .. }) => Err(RenderError::InvalidRenderResult {
            route: route.route,
            kind,
        }),
        Err(err) => {
            let err = match err {
                RenderError::Evaluation(message) => RenderError::RenderExecution {
                    route: route.route.clone(),
                    file: file.clone(),
                    message,
                    stats: Some(Box::new(stats)),
                },
                other => other,
            };
            tracing::error!(
                "An error occurred rendering route \"{}\" to {}",
                route.route,
                file.display()
            );
            if settings.write_error_pages {
                if let Err(write_err) = write_output(settings.fs.as_ref(), &file, &err.to_string()).await {
                    tracing::warn!("Unable to write error page {}: {write_err}", file.display());
                }
            }
            Err(err)
        }
    }
}

async fn write_output(fs: &dyn OutputFileSystem, file: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = file.parent() {
        fs.ensure_dir(parent).await?;
    }
    fs.write_file(file, contents).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
