//! RenderPlugin - build hook glue around the readiness coordinator
//!
//! The host build tool talks to the plugin through a [`RenderHandle`]:
//! 1. `build_started` / `assets_emitted` / `build_complete` per producer
//! 2. `render_when_ready` for ad hoc renders (e.g. a dev server)
//! 3. `renderer_ready` to wait for the first live renderer
//!
//! All mutable state lives in the [`RenderService`] actor, which processes
//! one message at a time. Each generation's renderer runs in its own V8
//! isolate, so nothing a bundle leaves on the global object reaches the
//! next build cycle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::{RenderConfig, Route};
use crate::coordinator::{Coordinator, ProducerId, ProducerPhase, Readiness, Role};
use crate::evaluator::linker::{ExternalResolver, HostModules};
use crate::evaluator::{EvaluatorOptions, ModuleEvaluator, ModuleHandle, RenderValue};
use crate::output::OutputFileSystem;
use crate::render::{self, RenderSettings};
use crate::source_map::{self, BuildOutput, SourceMap};
use crate::stats::{BuildStats, ProducerStats};
use crate::{ConfigurationError, Diagnostic, RenderError};

const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures producers and host capabilities, then splits into a service
/// and its handle.
pub struct RenderPlugin {
    config: RenderConfig,
    producers: Vec<(String, Role)>,
    settings_overrides: SettingsOverrides,
    externals: Arc<dyn ExternalResolver>,
    env: Option<BTreeMap<String, String>>,
}

#[derive(Default)]
struct SettingsOverrides {
    map_stats_to_params: Option<render::MapStatsToParams>,
    transform_file_path: Option<render::TransformFilePath>,
    fs: Option<Arc<dyn OutputFileSystem>>,
}

impl RenderPlugin {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            producers: Vec::new(),
            settings_overrides: SettingsOverrides::default(),
            externals: Arc::new(HostModules::new()),
            env: None,
        }
    }

    /// Register a producer. The one named `rendererName` renders; the rest
    /// are asset producers.
    pub fn producer(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let role = if name == self.config.renderer_name {
            Role::Renderer
        } else {
            Role::Assets
        };
        self.producer_with_role(name, role)
    }

    pub fn producer_with_role(mut self, name: impl Into<String>, role: Role) -> Self {
        self.producers.push((name.into(), role));
        self
    }

    pub fn with_stats_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Route, &BuildStats) -> serde_json::Map<String, serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        self.settings_overrides.map_stats_to_params = Some(Arc::new(mapper));
        self
    }

    pub fn with_path_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Route) -> String + Send + Sync + 'static,
    {
        self.settings_overrides.transform_file_path = Some(Arc::new(transform));
        self
    }

    pub fn with_externals(mut self, externals: impl ExternalResolver + 'static) -> Self {
        self.externals = Arc::new(externals);
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn OutputFileSystem>) -> Self {
        self.settings_overrides.fs = Some(fs);
        self
    }

    /// Replace the host environment exposed as `process.env`.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Validate the configuration and start the isolate.
    ///
    /// With no producers registered, a single producer named `rendererName`
    /// is assumed.
    pub fn build(self) -> Result<(RenderService, RenderHandle), ConfigurationError> {
        self.config.validate()?;

        let producers = if self.producers.is_empty() {
            vec![(self.config.renderer_name.clone(), Role::Renderer)]
        } else {
            self.producers
        };
        let coordinator = Coordinator::new(producers).map_err(|e| match e {
            ConfigurationError::MissingRenderer { .. } => ConfigurationError::MissingRenderer {
                expected: self.config.renderer_name.clone(),
            },
            other => other,
        })?;

        let mut settings = RenderSettings::from_config(&self.config).map_err(|e| {
            ConfigurationError::Invalid(format!("unable to resolve render directory: {e}"))
        })?;
        let overrides = self.settings_overrides;
        if let Some(mapper) = overrides.map_stats_to_params {
            settings.map_stats_to_params = mapper;
        }
        if let Some(transform) = overrides.transform_file_path {
            settings.transform_file_path = transform;
        }
        if let Some(fs) = overrides.fs {
            settings.fs = fs;
        }

        let mut evaluator_options = EvaluatorOptions {
            externals: self.externals,
            ..Default::default()
        };
        if let Some(env) = self.env {
            evaluator_options.env = env;
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let service = RenderService {
            config: self.config,
            settings,
            coordinator,
            evaluator_options,
            live: None,
            rendered_generation: None,
            render_queue: VecDeque::new(),
            ready_waiters: VecDeque::new(),
            commands: rx,
        };
        Ok((service, RenderHandle { commands: tx }))
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, RenderError>>;

enum Command {
    BuildStarted {
        producer: String,
        reply: Reply<()>,
    },
    AssetsEmitted {
        producer: String,
        output: BuildOutput,
        reply: Reply<()>,
    },
    BuildComplete {
        producer: String,
        reply: Reply<Vec<Diagnostic>>,
    },
    RenderWhenReady {
        route: Route,
        reply: Reply<String>,
    },
    RendererReady {
        reply: Reply<u64>,
    },
    Status {
        reply: Reply<BuildStatus>,
    },
}

/// Snapshot of the coordinator, for hosts and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub producers: Vec<ProducerSummary>,
    pub build_ready: bool,
    pub generation: u64,
    /// Generation of the renderer currently installed, if any.
    pub live_generation: Option<u64>,
    pub queued_renders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub name: String,
    pub role: Role,
    pub phase: ProducerPhase,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable, `Send` front door to a [`RenderService`].
///
/// Every method fails with [`RenderError::ServiceClosed`] once the service
/// has stopped.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    commands: mpsc::Sender<Command>,
}

impl RenderHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, RenderError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| RenderError::ServiceClosed)?;
        rx.await.map_err(|_| RenderError::ServiceClosed)?
    }

    pub async fn build_started(&self, producer: &str) -> Result<(), RenderError> {
        let producer = producer.to_string();
        self.request(|reply| Command::BuildStarted { producer, reply })
            .await
    }

    /// Capture a producer's output. May construct the renderer and drain
    /// queued requests before returning.
    pub async fn assets_emitted(&self, producer: &str, output: BuildOutput) -> Result<(), RenderError> {
        let producer = producer.to_string();
        self.request(|reply| Command::AssetsEmitted {
            producer,
            output,
            reply,
        })
        .await
    }

    /// Finish a producer's build. Runs the render pass when this completes
    /// the cycle and returns the producer's diagnostics.
    pub async fn build_complete(&self, producer: &str) -> Result<Vec<Diagnostic>, RenderError> {
        let producer = producer.to_string();
        self.request(|reply| Command::BuildComplete { producer, reply })
            .await
    }

    /// `build_started`, `assets_emitted` and `build_complete` in one call.
    pub async fn run_build(&self, producer: &str, output: BuildOutput) -> Result<Vec<Diagnostic>, RenderError> {
        self.build_started(producer).await?;
        self.assets_emitted(producer, output).await?;
        self.build_complete(producer).await
    }

    /// Render one route to a string once a renderer for the current build
    /// is live.
    pub async fn render_when_ready(&self, route: impl Into<Route>) -> Result<String, RenderError> {
        let route = route.into();
        self.request(|reply| Command::RenderWhenReady { route, reply })
            .await
    }

    /// Resolves with the generation of the live renderer.
    pub async fn renderer_ready(&self) -> Result<u64, RenderError> {
        self.request(|reply| Command::RendererReady { reply }).await
    }

    pub async fn status(&self) -> Result<BuildStatus, RenderError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A generation's renderer together with the isolate it was evaluated in.
struct LiveRenderer {
    generation: u64,
    file: String,
    evaluator: ModuleEvaluator,
    handle: ModuleHandle,
}

struct QueuedRender {
    route: Route,
    reply: Reply<String>,
}

/// Owns the coordinator, the live renderer and the request queues.
///
/// `!Send`: drive [`RenderService::run`] with `tokio::join!` or on a
/// `LocalSet`.
pub struct RenderService {
    config: RenderConfig,
    settings: RenderSettings,
    coordinator: Coordinator,
    evaluator_options: EvaluatorOptions,
    live: Option<LiveRenderer>,
    rendered_generation: Option<u64>,
    render_queue: VecDeque<QueuedRender>,
    ready_waiters: VecDeque<Reply<u64>>,
    commands: mpsc::Receiver<Command>,
}

impl RenderService {
    /// Process commands until every [`RenderHandle`] is dropped.
    pub async fn run(mut self) {
        tracing::debug!("Render service started");
        while let Some(command) = self.commands.recv().await {
            self.dispatch(command).await;
        }
        if let Some(mut live) = self.live.take() {
            live.evaluator.release(live.handle);
        }
        tracing::debug!(
            "Render service stopped with {} queued renders",
            self.render_queue.len()
        );
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::BuildStarted { producer, reply } => {
                let _ = reply.send(self.on_build_started(&producer));
            }
            Command::AssetsEmitted {
                producer,
                output,
                reply,
            } => {
                let result = self.on_assets_emitted(&producer, output).await;
                let _ = reply.send(result);
            }
            Command::BuildComplete { producer, reply } => {
                let result = self.on_build_complete(&producer).await;
                let _ = reply.send(result);
            }
            Command::RenderWhenReady { route, reply } => {
                if self.can_render() {
                    let result = self.render_to_string(&route).await;
                    let _ = reply.send(result);
                } else {
                    tracing::debug!("Queueing render of \"{}\" until the build is ready", route.route);
                    self.render_queue.push_back(QueuedRender { route, reply });
                }
            }
            Command::RendererReady { reply } => match &self.live {
                Some(live) if self.can_render() => {
                    let _ = reply.send(Ok(live.generation));
                }
                _ => self.ready_waiters.push_back(reply),
            },
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn producer_id(&self, name: &str) -> Result<ProducerId, RenderError> {
        self.coordinator
            .find(name)
            .ok_or_else(|| ConfigurationError::UnknownProducer(name.to_string()).into())
    }

    /// Renders are served only from a renderer built for the current cycle
    /// while every producer is ready.
    fn can_render(&self) -> bool {
        self.coordinator.is_build_ready()
            && self
                .live
                .as_ref()
                .is_some_and(|live| live.generation == self.coordinator.generation())
    }

    fn on_build_started(&mut self, producer: &str) -> Result<(), RenderError> {
        let id = self.producer_id(producer)?;
        self.coordinator.build_started(id)?;
        tracing::debug!("Build started for {producer} (generation {})", self.coordinator.generation());
        Ok(())
    }

    async fn on_assets_emitted(&mut self, producer: &str, output: BuildOutput) -> Result<(), RenderError> {
        let id = self.producer_id(producer)?;
        let source_map = match source_map::extract(&output).await {
            Ok(source_map) => source_map,
            Err(e) => {
                let err = RenderError::Io(e);
                self.coordinator.report_error(id, Diagnostic::render_failure(&err))?;
                return Err(err);
            }
        };
        let stats = ProducerStats::from_output(producer, &output);
        tracing::debug!("Captured {} files from {producer}", source_map.len());

        match self.coordinator.assets_emitted(id, source_map, stats)? {
            Readiness::Construct {
                generation,
                source_map,
            } => self.construct(generation, source_map).await,
            Readiness::Waiting { pending } => {
                if !pending.is_empty() {
                    tracing::debug!("Waiting for {} before rendering", pending.join(", "));
                }
            }
        }
        Ok(())
    }

    async fn on_build_complete(&mut self, producer: &str) -> Result<Vec<Diagnostic>, RenderError> {
        let id = self.producer_id(producer)?;
        let generation = self.coordinator.generation();

        if !self.config.skip_assets && self.can_render() && self.rendered_generation != Some(generation) {
            self.rendered_generation = Some(generation);
            if let Err(err) = self.render_pass().await {
                tracing::error!("Render pass failed: {err}");
                self.coordinator.report_error(id, Diagnostic::render_failure(&err))?;
            }
        }

        Ok(self.coordinator.errors(id)?.to_vec())
    }

    // -----------------------------------------------------------------------
    // Renderer construction
    // -----------------------------------------------------------------------

    async fn construct(&mut self, generation: u64, source_map: SourceMap) {
        let renderer_id = self.coordinator.renderer_id();

        // V8 isolates must be dropped in reverse creation order, so the
        // previous generation's isolate goes before the next one starts.
        if let Some(mut previous) = self.live.take() {
            tracing::debug!("Releasing renderer of generation {}", previous.generation);
            previous.evaluator.release(previous.handle);
        }

        match self.evaluate_renderer(&source_map) {
            Ok((file, evaluator, handle)) => {
                tracing::debug!("Renderer {file} is live for generation {generation}");
                self.live = Some(LiveRenderer {
                    generation,
                    file,
                    evaluator,
                    handle,
                });
                self.drain().await;
            }
            Err(err) => {
                tracing::error!("Unable to construct renderer: {err}");
                if let Err(e) = self
                    .coordinator
                    .report_error(renderer_id, Diagnostic::render_failure(&err))
                {
                    tracing::warn!("{e}");
                }
            }
        }
    }

    fn evaluate_renderer(
        &self,
        source_map: &SourceMap,
    ) -> Result<(String, ModuleEvaluator, ModuleHandle), RenderError> {
        let entry = &self.config.render_entry;
        let chunks = self
            .coordinator
            .renderer()
            .stats
            .as_ref()
            .map(|stats| stats.assets_by_chunk_name.clone())
            .unwrap_or_default();

        let file = chunks
            .get(entry)
            .and_then(|files| {
                files
                    .iter()
                    .find(|f| f.ends_with(".js"))
                    .or_else(|| files.first())
                    .cloned()
            })
            .ok_or_else(|| RenderError::RenderEntryNotFound {
                entry: entry.clone(),
                available: chunks.keys().cloned().collect(),
            })?;

        let mut evaluator = ModuleEvaluator::new(self.evaluator_options.clone())?;
        let handle = evaluator.evaluate(&file, source_map, &self.config.extra_globals)?;
        if !handle.is_callable() {
            let kind = handle.kind().to_string();
            evaluator.release(handle);
            return Err(RenderError::InvalidRenderer { file, kind });
        }
        Ok((file, evaluator, handle))
    }

    /// Wake `renderer_ready` waiters, then serve queued renders in order.
    async fn drain(&mut self) {
        if !self.can_render() {
            return;
        }
        let Some(generation) = self.live.as_ref().map(|live| live.generation) else {
            return;
        };
        while let Some(waiter) = self.ready_waiters.pop_front() {
            let _ = waiter.send(Ok(generation));
        }
        while let Some(QueuedRender { route, reply }) = self.render_queue.pop_front() {
            let result = self.render_to_string(&route).await;
            let _ = reply.send(result);
        }
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    async fn render_pass(&mut self) -> Result<(), RenderError> {
        let stats = self.coordinator.aggregate_stats();
        let Some(live) = self.live.as_mut() else {
            return Ok(());
        };
        let written = render::render_all(
            &mut live.evaluator,
            &live.handle,
            &self.config.routes,
            &stats,
            &self.settings,
        )
        .await?;

        if self.config.verbose {
            tracing::info!(
                "Rendered {} routes from {} into {}",
                written.len(),
                live.file,
                self.settings.render_directory.display()
            );
        }
        Ok(())
    }

    async fn render_to_string(&mut self, route: &Route) -> Result<String, RenderError> {
        let stats = self.coordinator.aggregate_stats();
        let params = self.settings.params(route, &stats);
        let Some(live) = self.live.as_mut() else {
            return Err(RenderError::ServiceClosed);
        };

        match live.evaluator.invoke(&live.handle, &params).await {
            Ok(RenderValue {
                value: Some(html), ..
            }) => Ok(html),
            Ok(RenderValue { kind, .. }) => Err(RenderError::InvalidRenderResult {
                route: route.route.clone(),
                kind,
            }),
            Err(RenderError::Evaluation(message)) => Err(RenderError::RenderExecution {
                route: route.route.clone(),
                file: self.settings.file_path(route),
                message,
                stats: None,
            }
            .with_stats(&stats)),
            Err(other) => Err(other),
        }
    }

    fn status(&self) -> BuildStatus {
        BuildStatus {
            producers: self
                .coordinator
                .producers()
                .map(|(_, p)| ProducerSummary {
                    name: p.name.clone(),
                    role: p.role,
                    phase: p.phase,
                    errors: p.errors.len(),
                })
                .collect(),
            build_ready: self.coordinator.is_build_ready(),
            generation: self.coordinator.generation(),
            live_generation: self.live.as_ref().map(|live| live.generation),
            queued_renders: self.render_queue.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_role_follows_renderer_name() {
        let plugin = RenderPlugin::new(RenderConfig::default())
            .producer("client")
            .producer("render");
        assert_eq!(
            plugin.producers,
            vec![("client".to_string(), Role::Assets), ("render".to_string(), Role::Renderer)]
        );
    }

    #[test]
    fn build_without_renderer_names_expected_producer() {
        let err = RenderPlugin::new(RenderConfig::default())
            .producer("client")
            .build()
            .err();
        assert_eq!(
            err,
            Some(ConfigurationError::MissingRenderer {
                expected: "render".into()
            })
        );
    }

    #[test]
    fn build_rejects_two_renderers() {
        let err = RenderPlugin::new(RenderConfig::default())
            .producer_with_role("a", Role::Renderer)
            .producer_with_role("b", Role::Renderer)
            .build()
            .err();
        assert!(matches!(err, Some(ConfigurationError::DuplicateRenderer { .. })));
    }

    #[tokio::test]
    async fn handle_reports_closed_service() {
        let (service, handle) = RenderPlugin::new(RenderConfig::default()).build().unwrap();
        drop(service);
        assert!(matches!(
            handle.build_started("render").await,
            Err(RenderError::ServiceClosed)
        ));
    }
}
