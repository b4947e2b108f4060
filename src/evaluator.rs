//! Module evaluator: runs compiled render bundles from an in-memory
//! [`SourceMap`] inside an embedded V8 isolate.
//!
//! Every call to [`ModuleEvaluator::evaluate`] starts a new *evaluation
//! tree*. A tree pins the snapshot and globals it was created with, so a
//! `require` executed later (for instance lazily, during a render) still
//! resolves against that exact snapshot even after a rebuild has produced a
//! newer one. Trees live until [`ModuleEvaluator::release`].
//!
//! Nested requires are not memoized: requiring the same file from two call
//! sites instantiates it twice.
//!
//! Trees of one evaluator share a single V8 realm: writes to `globalThis`
//! or to builtin prototypes are visible to every later tree. The render
//! service therefore starts a fresh evaluator for each build generation.
//!
//! The isolate is single threaded and the evaluator is `!Send`. Isolates
//! must be dropped in reverse creation order.

pub mod linker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use deno_core::{ascii_str, op2, v8, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::source_map::{self, SourceMap};
use crate::RenderError;
use linker::{ExternalResolver, HostModules, Linker, Resolution};

/// Identifier → value bindings merged into every evaluated module's scope.
pub type GlobalBindings = serde_json::Map<String, serde_json::Value>;

const BOOTSTRAP: &str = include_str!("evaluator/bootstrap.js");

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// Linkers of every live evaluation tree, keyed by tree id.
#[derive(Default)]
struct LinkerRegistry {
    trees: HashMap<u32, Linker>,
}

fn encode(resolution: &Resolution) -> String {
    serde_json::to_string(resolution).unwrap_or_else(|e| {
        serde_json::json!({ "kind": "missing", "message": e.to_string() }).to_string()
    })
}

fn released(tree: u32) -> Resolution {
    Resolution::Missing {
        message: format!("Module tree {tree} has been released"),
    }
}

#[op2]
#[string]
fn op_ssr_entry(state: &mut OpState, tree: u32, #[string] specifier: String) -> String {
    let resolution = match state.borrow::<LinkerRegistry>().trees.get(&tree) {
        Some(linker) => linker.entry(&specifier),
        None => released(tree),
    };
    encode(&resolution)
}

#[op2]
#[string]
fn op_ssr_link(
    state: &mut OpState,
    tree: u32,
    #[string] from: String,
    #[string] specifier: String,
    external: bool,
) -> String {
    let resolution = match state.borrow::<LinkerRegistry>().trees.get(&tree) {
        Some(linker) if external => linker.resolve_external(&from, &specifier),
        Some(linker) => linker.resolve(&from, &specifier),
        None => released(tree),
    };
    encode(&resolution)
}

#[op2]
fn op_ssr_log(level: u32, #[string] message: String) {
    match level {
        0 => tracing::error!(target: "static_render::console", "{message}"),
        1 => tracing::warn!(target: "static_render::console", "{message}"),
        2 => tracing::info!(target: "static_render::console", "{message}"),
        _ => tracing::debug!(target: "static_render::console", "{message}"),
    }
}

deno_core::extension!(ssr_runtime, ops = [op_ssr_entry, op_ssr_link, op_ssr_log]);

// ---------------------------------------------------------------------------
// Options & handles
// ---------------------------------------------------------------------------

/// Host facts exposed to evaluated code and the external module fallback.
#[derive(Clone)]
pub struct EvaluatorOptions {
    /// Exposed as `process.env`.
    pub env: BTreeMap<String, String>,
    /// Returned by `process.cwd()`.
    pub cwd: PathBuf,
    pub externals: Arc<dyn ExternalResolver>,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            env: std::env::vars().collect(),
            cwd: std::env::current_dir().unwrap_or_default(),
            externals: Arc::new(HostModules::new()),
        }
    }
}

impl fmt::Debug for EvaluatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorOptions")
            .field("env", &self.env.len())
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// The exported value of one evaluation tree, held inside the isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    tree: u32,
    specifier: String,
    kind: String,
}

impl ModuleHandle {
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    /// JS `typeof` of the exported value (`"null"` for null).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_callable(&self) -> bool {
        self.kind == "function"
    }
}

/// A render call that has been started but not yet awaited.
pub struct PendingRender {
    promise: v8::Global<v8::Value>,
}

/// Settled result of a render call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenderValue {
    /// JS `typeof` of the resolved value.
    #[serde(rename = "type")]
    pub kind: String,
    /// Present only when the value is a string.
    pub value: Option<String>,
}

#[derive(Deserialize)]
struct EvaluatedExport {
    #[serde(rename = "type")]
    kind: String,
}

fn js_error(e: impl fmt::Display) -> RenderError {
    RenderError::Evaluation(e.to_string())
}

// ---------------------------------------------------------------------------
// ModuleEvaluator
// ---------------------------------------------------------------------------

pub struct ModuleEvaluator {
    runtime: JsRuntime,
    externals: Arc<dyn ExternalResolver>,
    next_tree: u32,
}

impl fmt::Debug for ModuleEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEvaluator")
            .field("next_tree", &self.next_tree)
            .finish()
    }
}

impl ModuleEvaluator {
    pub fn new(options: EvaluatorOptions) -> Result<Self, RenderError> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ssr_runtime::init()],
            ..Default::default()
        });
        runtime.op_state().borrow_mut().put(LinkerRegistry::default());

        runtime
            .execute_script(ascii_str!("[ssr:bootstrap]"), BOOTSTRAP.to_string())
            .map_err(js_error)?;

        let host = serde_json::json!({
            "env": options.env,
            "cwd": options.cwd.to_string_lossy(),
            "platform": std::env::consts::OS,
        });
        runtime
            .execute_script(
                ascii_str!("[ssr:configure]"),
                format!("globalThis.__ssr.configure({host})"),
            )
            .map_err(js_error)?;

        Ok(Self {
            runtime,
            externals: options.externals,
            next_tree: 1,
        })
    }

    /// Evaluate `specifier` from `source_map` and return its default export.
    ///
    /// Compile and runtime exceptions thrown by the module surface as
    /// [`RenderError::Evaluation`] with the JS error text unmodified.
    pub fn evaluate(
        &mut self,
        specifier: &str,
        source_map: &SourceMap,
        globals: &GlobalBindings,
    ) -> Result<ModuleHandle, RenderError> {
        let key = source_map::normalize(specifier);
        if !source_map.contains(&key) {
            return Err(RenderError::ModuleNotFound {
                specifier: specifier.to_string(),
                from: None,
            });
        }

        let tree = self.next_tree;
        self.next_tree += 1;
        tracing::debug!("Evaluating source for {key} (tree {tree})");

        {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            state
                .borrow_mut::<LinkerRegistry>()
                .trees
                .insert(tree, Linker::new(source_map.clone(), Arc::clone(&self.externals)));
        }

        let script = format!(
            "globalThis.__ssr.evaluate({tree}, {}, {})",
            serde_json::Value::String(key.clone()),
            serde_json::Value::Object(globals.clone()),
        );
        let evaluated = self
            .runtime
            .execute_script(ascii_str!("[ssr:evaluate]"), script)
            .map_err(js_error)
            .and_then(|value| self.decode::<EvaluatedExport>(value));

        match evaluated {
            Ok(export) => Ok(ModuleHandle {
                tree,
                specifier: key,
                kind: export.kind,
            }),
            Err(err) => {
                self.drop_tree(tree);
                Err(err)
            }
        }
    }

    /// Start a render call without waiting for it to settle.
    pub fn dispatch(
        &mut self,
        handle: &ModuleHandle,
        params: &serde_json::Value,
    ) -> Result<PendingRender, RenderError> {
        let script = format!("globalThis.__ssr.invoke({}, {params})", handle.tree);
        let promise = self
            .runtime
            .execute_script(ascii_str!("[ssr:invoke]"), script)
            .map_err(js_error)?;
        Ok(PendingRender { promise })
    }

    /// Drive the event loop until a dispatched render settles.
    ///
    /// A thrown or rejected render surfaces as [`RenderError::Evaluation`];
    /// callers attach the route context.
    pub async fn settle(&mut self, pending: PendingRender) -> Result<RenderValue, RenderError> {
        let resolve = Box::pin(self.runtime.resolve(pending.promise));
        let value = self
            .runtime
            .with_event_loop_promise(resolve, PollEventLoopOptions::default())
            .await
            .map_err(js_error)?;
        self.decode(value)
    }

    /// Call the exported function with `params` and await its result.
    pub async fn invoke(
        &mut self,
        handle: &ModuleHandle,
        params: &serde_json::Value,
    ) -> Result<RenderValue, RenderError> {
        let pending = self.dispatch(handle, params)?;
        self.settle(pending).await
    }

    /// The exported value converted through `JSON.stringify`.
    pub fn export_json(&mut self, handle: &ModuleHandle) -> Result<serde_json::Value, RenderError> {
        let script = format!("globalThis.__ssr.exportJson({})", handle.tree);
        let value = self
            .runtime
            .execute_script(ascii_str!("[ssr:export]"), script)
            .map_err(js_error)?;
        let json: String = self.decode(value)?;
        serde_json::from_str(&json).map_err(js_error)
    }

    /// Drop an evaluation tree: its exported value, globals and snapshot.
    pub fn release(&mut self, handle: ModuleHandle) {
        self.drop_tree(handle.tree);
    }

    /// Number of evaluation trees still alive.
    pub fn live_trees(&mut self) -> usize {
        let state = self.runtime.op_state();
        let state = state.borrow();
        state.borrow::<LinkerRegistry>().trees.len()
    }

    fn drop_tree(&mut self, tree: u32) {
        {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            state.borrow_mut::<LinkerRegistry>().trees.remove(&tree);
        }
        let script = format!("globalThis.__ssr.release({tree})");
        if let Err(e) = self
            .runtime
            .execute_script(ascii_str!("[ssr:release]"), script)
        {
            tracing::warn!("Failed to release module tree {tree}: {e}");
        }
    }

    fn decode<T: DeserializeOwned>(&mut self, value: v8::Global<v8::Value>) -> Result<T, RenderError> {
        deno_core::scope!(scope, self.runtime);
        let local = v8::Local::new(scope, value);
        deno_core::serde_v8::from_v8(scope, local)
            .map_err(|e| RenderError::Evaluation(format!("unexpected value from isolate: {e:?}")))
    }
}
