//! Build readiness coordinator.
//!
//! Pure state machine over the producer build phases. It decides when the
//! renderer may be constructed; the render service acts on its answers.
//!
//! A *generation* is one build cycle. The renderer is constructed at most
//! once per generation, at the moment every producer has emitted its assets.
//! The next `build_started` after a construction attempt opens a new
//! generation.

use std::fmt;

use serde::Serialize;

use crate::source_map::SourceMap;
use crate::stats::{BuildStats, ProducerStats};
use crate::{ConfigurationError, Diagnostic};

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProducerId(usize);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Emits the render bundle. Exactly one producer has this role.
    Renderer,
    /// Emits assets the render waits for (e.g. the client build).
    Assets,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerPhase {
    #[default]
    NotStarted,
    Running,
    AssetsEmitted,
}

#[derive(Debug, Clone)]
pub struct ProducerStatus {
    pub name: String,
    pub role: Role,
    pub phase: ProducerPhase,
    /// Latest emitted snapshot. Only kept for the renderer.
    pub source_map: Option<SourceMap>,
    pub stats: Option<ProducerStats>,
    pub errors: Vec<Diagnostic>,
}

impl ProducerStatus {
    fn new(name: String, role: Role) -> Self {
        Self {
            name,
            role,
            phase: ProducerPhase::NotStarted,
            source_map: None,
            stats: None,
            errors: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ProducerPhase::AssetsEmitted
    }
}

/// Answer to an `assets_emitted` event.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Every producer is ready: construct the renderer from `source_map`.
    Construct { generation: u64, source_map: SourceMap },
    /// Still waiting on the named producers, or already constructed for
    /// this generation (`pending` is empty then).
    Waiting { pending: Vec<String> },
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Coordinator {
    producers: Vec<ProducerStatus>,
    renderer: Option<ProducerId>,
    generation: u64,
    attempted: bool,
}

impl Coordinator {
    /// Register `producers` in order. Exactly one must have the renderer role.
    pub fn new<I, S>(producers: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (S, Role)>,
        S: Into<String>,
    {
        let mut coordinator = Self {
            producers: Vec::new(),
            renderer: None,
            generation: 1,
            attempted: false,
        };
        for (name, role) in producers {
            coordinator.register(name, role)?;
        }
        if coordinator.renderer.is_none() {
            let expected = coordinator
                .producers
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            return Err(ConfigurationError::MissingRenderer { expected });
        }
        Ok(coordinator)
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        role: Role,
    ) -> Result<ProducerId, ConfigurationError> {
        let name = name.into();
        if self.producers.iter().any(|p| p.name == name) {
            return Err(ConfigurationError::Invalid(format!(
                "producer `{name}` is registered twice"
            )));
        }
        if role == Role::Renderer {
            if let Some(existing) = self.renderer {
                return Err(ConfigurationError::DuplicateRenderer {
                    first: self.producers[existing.0].name.clone(),
                    second: name,
                });
            }
        }

        let id = ProducerId(self.producers.len());
        tracing::debug!("Registered producer {name} ({role:?})");
        self.producers.push(ProducerStatus::new(name, role));
        if role == Role::Renderer {
            self.renderer = Some(id);
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// A producer started (re)building. Clears its previous errors.
    pub fn build_started(&mut self, id: ProducerId) -> Result<(), ConfigurationError> {
        self.producer(id)?;
        self.advance_if_attempted();
        let producer = self.producer_mut(id)?;
        producer.phase = ProducerPhase::Running;
        producer.errors.clear();
        Ok(())
    }

    /// A producer emitted its assets. Emitting without a preceding
    /// `build_started` counts as a new build of that producer.
    pub fn assets_emitted(
        &mut self,
        id: ProducerId,
        source_map: SourceMap,
        stats: ProducerStats,
    ) -> Result<Readiness, ConfigurationError> {
        if self.producer(id)?.phase != ProducerPhase::Running {
            self.advance_if_attempted();
        }

        let producer = self.producer_mut(id)?;
        producer.phase = ProducerPhase::AssetsEmitted;
        producer.stats = Some(stats);
        if producer.role == Role::Renderer {
            producer.source_map = Some(source_map);
        }

        let pending = self.pending();
        if !pending.is_empty() || self.attempted {
            return Ok(Readiness::Waiting { pending });
        }

        let source_map = self
            .renderer()
            .source_map
            .clone()
            .unwrap_or_default();
        self.attempted = true;
        tracing::debug!("All producers ready, constructing renderer for generation {}", self.generation);
        Ok(Readiness::Construct {
            generation: self.generation,
            source_map,
        })
    }

    pub fn report_error(
        &mut self,
        id: ProducerId,
        diagnostic: Diagnostic,
    ) -> Result<(), ConfigurationError> {
        self.producer_mut(id)?.errors.push(diagnostic);
        Ok(())
    }

    fn advance_if_attempted(&mut self) {
        if self.attempted {
            self.generation += 1;
            self.attempted = false;
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_build_ready(&self) -> bool {
        self.producers.iter().all(ProducerStatus::is_ready)
    }

    /// Names of producers that have not emitted in the current cycle.
    pub fn pending(&self) -> Vec<String> {
        self.producers
            .iter()
            .filter(|p| !p.is_ready())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn construction_attempted(&self) -> bool {
        self.attempted
    }

    pub fn find(&self, name: &str) -> Option<ProducerId> {
        self.producers
            .iter()
            .position(|p| p.name == name)
            .map(ProducerId)
    }

    pub fn producer(&self, id: ProducerId) -> Result<&ProducerStatus, ConfigurationError> {
        self.producers
            .get(id.0)
            .ok_or_else(|| ConfigurationError::UnknownProducer(id.to_string()))
    }

    pub fn producers(&self) -> impl Iterator<Item = (ProducerId, &ProducerStatus)> {
        self.producers
            .iter()
            .enumerate()
            .map(|(index, status)| (ProducerId(index), status))
    }

    pub fn renderer_id(&self) -> ProducerId {
        self.renderer.unwrap_or(ProducerId(0))
    }

    pub fn renderer(&self) -> &ProducerStatus {
        &self.producers[self.renderer_id().0]
    }

    pub fn errors(&self, id: ProducerId) -> Result<&[Diagnostic], ConfigurationError> {
        Ok(&self.producer(id)?.errors)
    }

    /// Latest stats of every producer that has emitted, with recorded
    /// diagnostics folded into each producer's `errors`.
    pub fn aggregate_stats(&self) -> BuildStats {
        let children = self
            .producers
            .iter()
            .filter_map(|p| {
                let mut stats = p.stats.clone()?;
                stats
                    .errors
                    .extend(p.errors.iter().map(|d| d.message.clone()));
                Some(stats)
            })
            .collect();
        BuildStats { children }
    }

    fn producer_mut(&mut self, id: ProducerId) -> Result<&mut ProducerStatus, ConfigurationError> {
        self.producers
            .get_mut(id.0)
            .ok_or_else(|| ConfigurationError::UnknownProducer(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
