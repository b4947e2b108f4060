//! Build statistics handed to `map_stats_to_params` and attached to
//! render errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::source_map::BuildOutput;

/// Statistics for one producer's latest build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStats {
    pub name: String,
    pub assets: Vec<String>,
    pub assets_by_chunk_name: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Host supplied statistics, forwarded as is.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl ProducerStats {
    pub fn from_output(name: &str, output: &BuildOutput) -> Self {
        Self {
            name: name.to_string(),
            assets: output.file_names(),
            assets_by_chunk_name: output.assets_by_chunk_name(),
            errors: Vec::new(),
            extra: output.extra_stats.clone(),
        }
    }
}

/// Aggregated statistics across every producer that has emitted at least once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    pub children: Vec<ProducerStats>,
}

impl BuildStats {
    pub fn producer(&self, name: &str) -> Option<&ProducerStats> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn has_errors(&self) -> bool {
        self.children.iter().any(|c| !c.errors.is_empty())
    }
}
