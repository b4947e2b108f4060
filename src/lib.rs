//! # Static Render
//!
//! Build plugin that renders application routes to static HTML.
//!
//! A build runs as one or more producer phases (typically a `client` build
//! emitting browser assets and a `render` build emitting a server-side
//! render function). The plugin waits until every producer has emitted its
//! assets, evaluates the render bundle straight from the in-memory build
//! output, and writes one HTML file per route.
//!
//! The render bundle is never written to disk before evaluation. Its
//! modules are executed inside an embedded V8 isolate with a custom
//! `require` that resolves relative imports against sibling outputs and
//! falls back to an injected external resolver for everything else.

pub mod config;
pub mod coordinator;
pub mod evaluator;
pub mod output;
pub mod plugin;
pub mod render;
pub mod source_map;
pub mod stats;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{RenderConcurrency, RenderConfig, Route};
pub use evaluator::linker::{ExternalModule, ExternalResolver, HostModules};
pub use evaluator::{GlobalBindings, ModuleEvaluator, ModuleHandle};
pub use output::{DiskFileSystem, MemoryFileSystem, OutputFileSystem};
pub use plugin::{BuildStatus, RenderHandle, RenderPlugin, RenderService};
pub use source_map::{BuildOutput, OutputArtifact, SourceMap};
pub use stats::{BuildStats, ProducerStats};

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic recorded against a producer's build.
///
/// Render failures never crash the host. They are pushed into the error
/// list of the build that triggered the render pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    /// Wrap a failed render pass as a build error.
    pub fn render_failure(error: &RenderError) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: format!("An error occurred during render:\n{error}"),
            context: error.route().map(|route| format!("route: {route}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// Fatal errors raised while the plugin is being configured.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Producer `{second}` cannot render: `{first}` is already the renderer producer")]
    DuplicateRenderer { first: String, second: String },

    #[error("No renderer producer registered. Expected a producer named `{expected}` or one registered with the renderer role")]
    MissingRenderer { expected: String },

    #[error("Unknown producer `{0}`")]
    UnknownProducer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// RenderError
// ---------------------------------------------------------------------------

/// Errors raised while constructing a renderer or rendering routes.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Cannot find module '{specifier}'{}", .from.as_ref().map(|f| format!(" from '{f}'")).unwrap_or_default())]
    ModuleNotFound {
        specifier: String,
        from: Option<String>,
    },

    #[error("Unable to find renderEntry \"{entry}\" in assets. Possible entries are: {}.", .available.join(", "))]
    RenderEntryNotFound {
        entry: String,
        available: Vec<String>,
    },

    #[error("Unable to find render function. File \"{file}\". Received {kind}.")]
    InvalidRenderer { file: String, kind: String },

    #[error("Render must return a string. Received \"{kind}\" for route \"{route}\".")]
    InvalidRenderResult { route: String, kind: String },

    #[error("An error occurred rendering route \"{route}\" ({}): {message}", .file.display())]
    RenderExecution {
        route: String,
        file: PathBuf,
        message: String,
        stats: Option<Box<BuildStats>>,
    },

    #[error("Module evaluation failed: {0}")]
    Evaluation(String),

    #[error("{} routes failed to render:\n{}", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Aggregate(Vec<RenderError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Render service has shut down")]
    ServiceClosed,
}

impl RenderError {
    /// The build statistics captured when a render function failed.
    pub fn stats(&self) -> Option<&BuildStats> {
        match self {
            RenderError::RenderExecution { stats, .. } => stats.as_deref(),
            _ => None,
        }
    }

    /// The route a per-route error was raised for.
    pub fn route(&self) -> Option<&str> {
        match self {
            RenderError::InvalidRenderResult { route, .. }
            | RenderError::RenderExecution { route, .. } => Some(route),
            _ => None,
        }
    }

    /// Attach the current build statistics to an execution error.
    pub(crate) fn with_stats(self, snapshot: &BuildStats) -> Self {
        match self {
            RenderError::RenderExecution {
                route,
                file,
                message,
                ..
            } => RenderError::RenderExecution {
                route,
                file,
                message,
                stats: Some(Box::new(snapshot.clone())),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_not_found_message_names_requester() {
        let err = RenderError::ModuleNotFound {
            specifier: "./chunk.js".into(),
            from: Some("main.js".into()),
        };
        assert_eq!(err.to_string(), "Cannot find module './chunk.js' from 'main.js'");

        let bare = RenderError::ModuleNotFound {
            specifier: "main.js".into(),
            from: None,
        };
        assert_eq!(bare.to_string(), "Cannot find module 'main.js'");
    }

    #[test]
    fn render_entry_not_found_lists_chunks() {
        let err = RenderError::RenderEntryNotFound {
            entry: "main".into(),
            available: vec!["client".into(), "vendor".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unable to find renderEntry \"main\" in assets. Possible entries are: client, vendor."
        );
    }

    #[test]
    fn with_stats_only_touches_execution_errors() {
        let stats = BuildStats::default();
        let err = RenderError::RenderExecution {
            route: "/".into(),
            file: PathBuf::from("/dist/index.html"),
            message: "boom".into(),
            stats: None,
        }
        .with_stats(&stats);
        assert!(err.stats().is_some());

        let other = RenderError::Evaluation("x".into()).with_stats(&stats);
        assert!(other.stats().is_none());
    }

    #[test]
    fn render_failure_diagnostic_carries_route() {
        let err = RenderError::InvalidRenderResult {
            route: "/about".into(),
            kind: "number".into(),
        };
        let diagnostic = Diagnostic::render_failure(&err);
        assert_eq!(diagnostic.level, DiagnosticLevel::Error);
        assert!(diagnostic.message.starts_with("An error occurred during render:"));
        assert_eq!(diagnostic.context.as_deref(), Some("route: /about"));
    }
}
