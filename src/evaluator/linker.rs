//! Import resolution for evaluated modules.
//!
//! The linker decides, for every `require(specifier)` executed inside an
//! evaluated module, whether the import is another file of the current
//! [`SourceMap`] or must come from the host. Host resolution goes through an
//! injected [`ExternalResolver`] capability; evaluated code never reaches the
//! host module system any other way.
//!
//! Resolution is pure: it returns a [`Resolution`] describing what to
//! instantiate, and the evaluator does the instantiation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arcstr::ArcStr;
use serde::Serialize;

use crate::source_map::{self, SourceMap};

// ---------------------------------------------------------------------------
// External resolution capability
// ---------------------------------------------------------------------------

/// A module supplied by the host rather than by the build output.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalModule {
    /// CommonJS source evaluated like any other module. Its own `require`
    /// calls resolve externally only.
    Source(ArcStr),
    /// A plain value handed to the caller as the module's exports.
    Value(serde_json::Value),
}

/// Fallback for imports that are not part of the build output.
pub trait ExternalResolver: Send + Sync {
    fn resolve(&self, specifier: &str) -> Option<ExternalModule>;
}

impl<F> ExternalResolver for F
where
    F: Fn(&str) -> Option<ExternalModule> + Send + Sync,
{
    fn resolve(&self, specifier: &str) -> Option<ExternalModule> {
        self(specifier)
    }
}

/// Registry of named host modules, the usual [`ExternalResolver`].
#[derive(Debug, Clone, Default)]
pub struct HostModules {
    modules: HashMap<String, ExternalModule>,
}

impl HostModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, name: impl Into<String>, source: impl Into<ArcStr>) -> Self {
        self.modules
            .insert(name.into(), ExternalModule::Source(source.into()));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.modules.insert(name.into(), ExternalModule::Value(value));
        self
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ExternalResolver for HostModules {
    fn resolve(&self, specifier: &str) -> Option<ExternalModule> {
        self.modules.get(specifier).cloned()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of resolving one import. Serialized to JSON for the JS side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Resolution {
    /// A file of the current source map, to be instantiated in the same tree.
    Asset { specifier: String, source: ArcStr },
    /// Host supplied source.
    ExternalSource { specifier: String, source: ArcStr },
    /// Host supplied value.
    Value { value: serde_json::Value },
    Missing { message: String },
}

// ---------------------------------------------------------------------------
// Linker
// ---------------------------------------------------------------------------

/// Resolves imports for one evaluation tree against one snapshot.
#[derive(Clone)]
pub struct Linker {
    source_map: SourceMap,
    externals: Arc<dyn ExternalResolver>,
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("files", &self.source_map.len())
            .finish()
    }
}

impl Linker {
    pub fn new(source_map: SourceMap, externals: Arc<dyn ExternalResolver>) -> Self {
        Self {
            source_map,
            externals,
        }
    }

    /// Look up an entry module. Entries never fall back to the host.
    pub fn entry(&self, specifier: &str) -> Resolution {
        let key = source_map::normalize(specifier);
        match self.source_map.get(&key) {
            Some(source) => Resolution::Asset {
                specifier: key,
                source: source.clone(),
            },
            None => Resolution::Missing {
                message: format!("Cannot find module '{specifier}'"),
            },
        }
    }

    /// Resolve `import` as required from `requesting`.
    ///
    /// The import is joined onto the requesting module's directory first;
    /// the bare normalized import is tried second so chunks emitted at the
    /// output root stay reachable from nested modules. Anything else goes to
    /// the external resolver verbatim.
    pub fn resolve(&self, requesting: &str, import: &str) -> Resolution {
        let absolute = source_map::join(source_map::dirname(requesting), import);
        if let Some(source) = self.source_map.get(&absolute) {
            tracing::trace!("Linking {requesting} to asset {absolute}");
            return Resolution::Asset {
                specifier: absolute,
                source: source.clone(),
            };
        }

        let bare = source_map::normalize(import);
        if let Some(source) = self.source_map.get(&bare) {
            tracing::trace!("Linking {requesting} to asset {bare}");
            return Resolution::Asset {
                specifier: bare,
                source: source.clone(),
            };
        }

        tracing::trace!("Using external require for {import} from {requesting}");
        self.resolve_external(requesting, import)
    }

    /// Resolve through the host capability only.
    pub fn resolve_external(&self, requesting: &str, import: &str) -> Resolution {
        match self.externals.resolve(import) {
            Some(ExternalModule::Source(source)) => Resolution::ExternalSource {
                specifier: import.to_string(),
                source,
            },
            Some(ExternalModule::Value(value)) => Resolution::Value { value },
            None => Resolution::Missing {
                message: format!("Cannot find module '{import}' from '{requesting}'"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
