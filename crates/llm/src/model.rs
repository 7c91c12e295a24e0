use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use snafu::ResultExt;
use tokio::sync::RwLock;

use super::error::{PayloadParseSnafu, ProviderResult};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:latest";
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// A model installed on (or suggested for) the server. Ids are Ollama tags
/// such as `qwen2.5:7b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub size_bytes: Option<u64>,
    pub parameter_size: Option<String>,
    pub quantization: Option<String>,
}

impl Model {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            size_bytes: None,
            parameter_size: None,
            quantization: None,
        }
    }

    /// `7.6B · Q4_K_M · 4.4 GB`, or whichever parts the server reported.
    pub fn summary(&self) -> Option<String> {
        let parts = [
            self.parameter_size.clone(),
            self.quantization.clone(),
            self.size_bytes.map(format_size),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

        (!parts.is_empty()).then(|| parts.join(" · "))
    }

    fn matches(&self, model_id: &str) -> bool {
        canonical_tag(&self.id) == canonical_tag(model_id)
    }
}

/// Ollama resolves an untagged name to its `latest` tag.
fn canonical_tag(model_id: &str) -> String {
    let model_id = model_id.trim();
    if model_id.contains(':') {
        model_id.to_string()
    } else {
        format!("{model_id}:latest")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    Server,
    Cache,
    /// The server could not be reached; these are the last models it reported.
    StaleCache { error: String },
    /// The server was never reached; these are built-in suggestions.
    Fallback { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAvailability {
    Installed,
    Missing,
    /// The catalog did not come from the server, so absence proves nothing.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: CatalogSource,
}

impl ModelCatalog {
    pub fn new(models: Vec<Model>, source: CatalogSource) -> Self {
        Self { models, source }
    }

    pub fn warning(&self) -> Option<&str> {
        match &self.source {
            CatalogSource::Server | CatalogSource::Cache => None,
            CatalogSource::StaleCache { error } | CatalogSource::Fallback { error } => {
                Some(error)
            }
        }
    }

    pub fn availability(&self, model_id: &str) -> ModelAvailability {
        if self.models.iter().any(|model| model.matches(model_id)) {
            return ModelAvailability::Installed;
        }
        match self.source {
            CatalogSource::Server | CatalogSource::Cache => ModelAvailability::Missing,
            CatalogSource::StaleCache { .. } | CatalogSource::Fallback { .. } => {
                ModelAvailability::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(Vec<Model>),
    Stale(Vec<Model>),
    Miss,
}

/// Model lists keyed by server URL. Entries older than the TTL are still
/// handed out as `Stale` so an unreachable server can fall back to them.
#[derive(Debug)]
pub struct ModelCache {
    entries: RwLock<HashMap<String, (Instant, Vec<Model>)>>,
    ttl: Duration,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(MODEL_CACHE_TTL)
    }
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn lookup(&self, server: &str) -> CacheLookup {
        match self.entries.read().await.get(server) {
            Some((stored_at, models)) if stored_at.elapsed() < self.ttl => {
                CacheLookup::Fresh(models.clone())
            }
            Some((_, models)) => CacheLookup::Stale(models.clone()),
            None => CacheLookup::Miss,
        }
    }

    pub async fn store(&self, server: &str, models: Vec<Model>) {
        self.entries
            .write()
            .await
            .insert(server.to_string(), (Instant::now(), models));
    }

    /// Forgets the server's list after its installed models changed.
    pub async fn invalidate(&self, server: &str) {
        self.entries.write().await.remove(server);
    }
}

pub fn default_ollama_models() -> Vec<Model> {
    [
        DEFAULT_OLLAMA_MODEL,
        "llama3.1:latest",
        "qwen2.5:latest",
        "mistral:latest",
    ]
    .into_iter()
    .map(Model::named)
    .collect()
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    parameter_size: Option<String>,
    #[serde(default)]
    quantization_level: Option<String>,
}

/// Parses the body of `GET /api/tags` into models sorted by id. Entries with a
/// blank name are skipped.
pub fn parse_tags_payload(payload: &str) -> ProviderResult<Vec<Model>> {
    let response: TagsResponse = serde_json::from_str(payload).context(PayloadParseSnafu {
        stage: "parse-tags-response",
    })?;

    let mut models = response
        .models
        .into_iter()
        .filter_map(|entry| {
            let id = entry.name.trim();
            if id.is_empty() {
                return None;
            }
            let details = entry.details.unwrap_or_default();
            Some(Model {
                id: id.to_string(),
                size_bytes: entry.size,
                parameter_size: details.parameter_size,
                quantization: details.quantization_level,
            })
        })
        .collect::<Vec<_>>();

    models.sort_by(|left, right| left.id.cmp(&right.id));
    models.dedup_by(|left, right| left.id == right.id);
    Ok(models)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
