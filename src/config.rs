//! Plugin configuration.
//!
//! Everything that can be expressed as data lives in [`RenderConfig`] and
//! deserializes from JSON. Function-valued options (stats mapping, path
//! transform, external modules) are set on [`crate::RenderPlugin`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfigurationError;

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One unit of work to render: a path plus arbitrary caller metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RouteRepr")]
pub struct Route {
    pub route: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Route {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The route's fields as a flat JSON object.
    pub fn to_params(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut params = self.extra.clone();
        params.insert("route".into(), serde_json::Value::String(self.route.clone()));
        params
    }
}

impl From<&str> for Route {
    fn from(route: &str) -> Self {
        Route::new(route)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteRepr {
    Path(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl TryFrom<RouteRepr> for Route {
    type Error = String;

    fn try_from(repr: RouteRepr) -> Result<Self, Self::Error> {
        match repr {
            RouteRepr::Path(route) => Ok(Route::new(route)),
            RouteRepr::Object(mut fields) => match fields.remove("route") {
                Some(serde_json::Value::String(route)) => Ok(Route {
                    route,
                    extra: fields,
                }),
                other => {
                    if let Some(value) = other {
                        fields.insert("route".into(), value);
                    }
                    Err(format!(
                        "Missing route in {}. Unable to render page without a route.",
                        serde_json::Value::Object(fields)
                    ))
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// RenderConcurrency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderConcurrency {
    /// One route at a time, in order.
    #[default]
    Serial,
    /// Every route dispatched at once; completion order unspecified.
    Parallel,
}

// ---------------------------------------------------------------------------
// RenderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenderConfig {
    #[serde(default = "default_routes")]
    pub routes: Vec<Route>,
    #[serde(default = "default_render_directory")]
    pub render_directory: PathBuf,
    /// Chunk name of the render bundle's entry.
    #[serde(default = "default_render_entry")]
    pub render_entry: String,
    #[serde(default)]
    pub render_concurrency: RenderConcurrency,
    /// Merged into the top-level scope of every evaluated module.
    #[serde(default)]
    pub extra_globals: serde_json::Map<String, serde_json::Value>,
    /// Skip writing route files; only `render_when_ready` renders.
    #[serde(default)]
    pub skip_assets: bool,
    #[serde(default)]
    pub verbose: bool,
    /// Name of the producer whose output holds the render bundle.
    #[serde(default = "default_renderer_name")]
    pub renderer_name: String,
    /// Write the error text to a route's output file when its render throws.
    #[serde(default = "default_true")]
    pub write_error_pages: bool,
}

fn default_routes() -> Vec<Route> {
    vec![Route::new("")]
}

fn default_render_directory() -> PathBuf {
    PathBuf::from("dist")
}

fn default_render_entry() -> String {
    "main".into()
}

fn default_renderer_name() -> String {
    "render".into()
}

fn default_true() -> bool {
    true
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            render_directory: default_render_directory(),
            render_entry: default_render_entry(),
            render_concurrency: RenderConcurrency::default(),
            extra_globals: serde_json::Map::new(),
            skip_assets: false,
            verbose: false,
            renderer_name: default_renderer_name(),
            write_error_pages: true,
        }
    }
}

impl RenderConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: RenderConfig = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.render_entry.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "renderEntry must not be empty".into(),
            ));
        }
        if self.render_directory.as_os_str().is_empty() {
            return Err(ConfigurationError::Invalid(
                "renderDirectory must not be empty".into(),
            ));
        }
        if self.renderer_name.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "rendererName must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// The render directory, resolved against the current directory.
    pub fn absolute_render_directory(&self) -> std::io::Result<PathBuf> {
        if self.render_directory.is_absolute() {
            Ok(self.render_directory.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.render_directory))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
