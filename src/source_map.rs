//! In-memory build output and the `SourceMap` snapshot taken from it.
//!
//! A producer hands over its emitted artifacts as a [`BuildOutput`].
//! [`extract`] materializes every artifact into text and freezes the result
//! into a [`SourceMap`], the module universe the evaluator runs against.
//! A new snapshot replaces the old one on every rebuild; a snapshot is
//! never mutated after construction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arcstr::ArcStr;

// ---------------------------------------------------------------------------
// Build Output
// ---------------------------------------------------------------------------

/// Content of an emitted asset.
#[derive(Debug, Clone)]
pub enum AssetSource {
    Str(ArcStr),
    Bytes(Vec<u8>),
    /// The host already wrote the asset to disk; it is read back on extract.
    File(PathBuf),
}

/// An emitted JS chunk.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Logical chunk name (the entry name, e.g. `main`).
    pub name: String,
    pub file_name: String,
    pub code: ArcStr,
}

/// Any non-chunk emitted file.
#[derive(Debug, Clone)]
pub struct OutputAsset {
    pub file_name: String,
    pub source: AssetSource,
}

#[derive(Debug, Clone)]
pub enum OutputArtifact {
    Chunk(OutputChunk),
    Asset(OutputAsset),
}

impl OutputArtifact {
    pub fn chunk(name: impl Into<String>, file_name: impl Into<String>, code: impl Into<ArcStr>) -> Self {
        OutputArtifact::Chunk(OutputChunk {
            name: name.into(),
            file_name: file_name.into(),
            code: code.into(),
        })
    }

    pub fn asset(file_name: impl Into<String>, source: AssetSource) -> Self {
        OutputArtifact::Asset(OutputAsset {
            file_name: file_name.into(),
            source,
        })
    }

    pub fn file_name(&self) -> &str {
        match self {
            OutputArtifact::Chunk(c) => &c.file_name,
            OutputArtifact::Asset(a) => &a.file_name,
        }
    }
}

/// Everything one producer emitted in a single build.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub artifacts: Vec<OutputArtifact>,
    /// Opaque host statistics (public path, entrypoints, hash...), forwarded
    /// untouched into [`crate::ProducerStats::extra`].
    pub extra_stats: serde_json::Value,
}

impl BuildOutput {
    pub fn new(artifacts: Vec<OutputArtifact>) -> Self {
        Self {
            artifacts,
            extra_stats: serde_json::Value::Null,
        }
    }

    pub fn with_extra_stats(mut self, extra: serde_json::Value) -> Self {
        self.extra_stats = extra;
        self
    }

    /// Chunk name → emitted file names, in emission order.
    pub fn assets_by_chunk_name(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_chunk: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for artifact in &self.artifacts {
            if let OutputArtifact::Chunk(chunk) = artifact {
                by_chunk
                    .entry(chunk.name.clone())
                    .or_default()
                    .push(normalize(&chunk.file_name));
            }
        }
        by_chunk
    }

    /// Sorted, de-duplicated file names of every artifact.
    pub fn file_names(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|a| normalize(a.file_name()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Collect a build that was already written to `dir`.
    ///
    /// Every file becomes a file-backed asset. Each `.js` file is also
    /// registered as a chunk named after its file stem, so `main.js`
    /// resolves as the `main` render entry.
    pub async fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut artifacts = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");

                let is_js = path.extension().is_some_and(|ext| ext == "js");
                if is_js {
                    let stem = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let code = tokio::fs::read_to_string(&path).await?;
                    artifacts.push(OutputArtifact::chunk(stem, relative, code));
                } else {
                    artifacts.push(OutputArtifact::asset(relative, AssetSource::File(path)));
                }
            }
        }

        // read_dir order is platform dependent
        artifacts.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        Ok(Self::new(artifacts))
    }
}

// ---------------------------------------------------------------------------
// SourceMap
// ---------------------------------------------------------------------------

/// Immutable `{ specifier → source text }` snapshot of one build's output.
///
/// Keys are normalized (no leading `./`, `/` separators). Cloning is cheap
/// and every clone observes the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: Arc<BTreeMap<String, ArcStr>>,
}

impl SourceMap {
    pub fn from_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ArcStr>,
    {
        Self {
            files: Arc::new(
                files
                    .into_iter()
                    .map(|(k, v)| (normalize(k.as_ref()), v.into()))
                    .collect(),
            ),
        }
    }

    /// Look up a specifier, ignoring any leading `./`.
    pub fn get(&self, specifier: &str) -> Option<&ArcStr> {
        self.files.get(normalize(specifier).as_str())
    }

    pub fn contains(&self, specifier: &str) -> bool {
        self.get(specifier).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether two handles share the same underlying snapshot.
    pub fn same_snapshot(&self, other: &SourceMap) -> bool {
        Arc::ptr_eq(&self.files, &other.files)
    }
}

// ---------------------------------------------------------------------------
// Asset Source Adapter
// ---------------------------------------------------------------------------

/// Snapshot a completed build's artifacts into a [`SourceMap`].
///
/// File-backed assets are read from disk; a read failure propagates rather
/// than dropping the artifact. Byte assets are decoded lossily since binary
/// files are never valid modules anyway.
pub async fn extract(output: &BuildOutput) -> std::io::Result<SourceMap> {
    let mut files = BTreeMap::new();
    for artifact in &output.artifacts {
        let text: ArcStr = match artifact {
            OutputArtifact::Chunk(chunk) => chunk.code.clone(),
            OutputArtifact::Asset(asset) => match &asset.source {
                AssetSource::Str(s) => s.clone(),
                AssetSource::Bytes(b) => ArcStr::from(String::from_utf8_lossy(b).as_ref()),
                AssetSource::File(path) => ArcStr::from(tokio::fs::read_to_string(path).await?),
            },
        };
        files.insert(normalize(artifact.file_name()), text);
    }
    tracing::debug!("Captured source map with {} files", files.len());
    Ok(SourceMap {
        files: Arc::new(files),
    })
}

// ---------------------------------------------------------------------------
// Specifier helpers
// ---------------------------------------------------------------------------

/// Normalize a module specifier: strip `./` prefixes, collapse `.` and `..`
/// segments and unify separators. Leading `..` that escape the root are kept.
pub fn normalize(specifier: &str) -> String {
    let unified = specifier.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Directory part of a normalized specifier (`""` for root-level modules).
pub fn dirname(specifier: &str) -> &str {
    match specifier.rfind('/') {
        Some(idx) => &specifier[..idx],
        None => "",
    }
}

/// Join `specifier` onto `dir` and normalize the result.
pub fn join(dir: &str, specifier: &str) -> String {
    if dir.is_empty() {
        normalize(specifier)
    } else {
        normalize(&format!("{dir}/{specifier}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
