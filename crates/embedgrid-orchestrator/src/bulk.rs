//! Bulk embeds and scale-out.
//!
//! Inputs are normalized up front, then processed in fixed-size batches.
//! After each batch the task yields to the scheduler so one huge request
//! cannot starve other callers sharing the runtime.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use embedgrid_model::{
    CONTENT_IMPRINT_METADATA_KEY, PROXY_NODE_METADATA_KEY, ProxyRequirement, SessionDefinition,
    SessionId, normalize_country_codes,
};

use crate::orchestrator::{SessionOrchestrator, new_session_id};
use crate::types::BulkFailure;

/// Fraction of the scale-out target that counts as reached.
pub const SCALE_TARGET_TOLERANCE: f64 = 0.95;
pub const MIN_SCALE_BATCH: u64 = 50;
pub const MAX_SCALE_BATCH: u64 = 1_000;

/// What to do with input that is not a usable http(s) URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Substitute a deterministic placeholder URL and keep going.
    #[default]
    Synthesize,
    /// Record the item as a failure.
    Reject,
    /// Substitute a deterministic loopback URL and keep going.
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkEmbedRequest {
    pub urls: Vec<String>,
    /// Labels become `"{prefix} #{index}"`.
    pub label_prefix: Option<String>,
    /// Proxy countries, handed out round-robin by item index.
    pub countries: Vec<String>,
    pub geo_affinity: Vec<String>,
    pub target_replica_count: u64,
    pub tags: Vec<String>,
    pub sticky: bool,
    pub fallback_strategy: FallbackStrategy,
    /// Overrides the configured batch size.
    pub batch_size: Option<usize>,
}

impl Default for BulkEmbedRequest {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            label_prefix: None,
            countries: Vec::new(),
            geo_affinity: Vec::new(),
            target_replica_count: 1,
            tags: Vec::new(),
            sticky: false,
            fallback_strategy: FallbackStrategy::default(),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEmbedSuccess {
    pub index: usize,
    pub session_id: SessionId,
    pub url: String,
    pub proxy_id: String,
    /// Bound to the fallback node because no pool could take it.
    pub fallback_proxy: bool,
    /// The input was replaced by a synthetic or loopback URL.
    pub substituted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEmbedResult {
    pub total: usize,
    pub successes: Vec<BulkEmbedSuccess>,
    pub failures: Vec<BulkFailure>,
    pub batches: usize,
    pub average_processing_ms: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleResult {
    pub target: u64,
    pub initial_count: u64,
    pub final_count: u64,
    pub created: usize,
    pub failed: usize,
    /// 0 when nothing needed creating.
    pub batch_size: usize,
    pub target_reached: bool,
    pub elapsed_ms: u64,
}

/// Normalize `raw` into an absolute http(s) URL. Bare hosts get `https://`.
pub fn normalize_url(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty input".to_string());
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme {other}")),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(parsed.to_string())
}

/// Adaptive batch size for creating `delta` sessions.
pub fn scale_batch_size(delta: u64) -> usize {
    delta.div_ceil(100).clamp(MIN_SCALE_BATCH, MAX_SCALE_BATCH) as usize
}

/// An input that survived normalization.
struct PreparedEmbed {
    index: usize,
    url: String,
    imprint: Option<String>,
}

impl SessionOrchestrator {
    fn prepare_embed(&self, index: usize, raw: &str, strategy: FallbackStrategy) -> Result<PreparedEmbed, BulkFailure> {
        match normalize_url(raw) {
            Ok(url) => Ok(PreparedEmbed {
                index,
                url,
                imprint: None,
            }),
            Err(reason) => {
                let url = match strategy {
                    FallbackStrategy::Reject => {
                        return Err(BulkFailure {
                            index,
                            input: Some(raw.to_string()),
                            reason: format!("rejected: {reason}"),
                        });
                    }
                    FallbackStrategy::Synthesize => self.content.synthetic_url(raw),
                    FallbackStrategy::Loopback => self.content.loopback_url(raw),
                };
                debug!(index, %reason, ?strategy, "substituted unusable embed input");
                Ok(PreparedEmbed {
                    index,
                    url,
                    imprint: Some(self.content.imprint(raw)),
                })
            }
        }
    }

    /// Create one session per input URL, each bound to a proxy node.
    ///
    /// Never fails as a whole: rejected inputs and failed upserts are
    /// reported in `failures` next to the successes.
    pub async fn create_bulk_embeds(&self, request: BulkEmbedRequest) -> BulkEmbedResult {
        let started = Instant::now();
        let batch_size = request.batch_size.unwrap_or(self.config.batch_size).max(1);
        let countries = normalize_country_codes(&request.countries);
        let country_for = |index: usize| -> Option<String> {
            if countries.is_empty() {
                None
            } else {
                Some(countries[index % countries.len()].clone())
            }
        };

        let mut result = BulkEmbedResult {
            total: request.urls.len(),
            ..BulkEmbedResult::default()
        };

        let mut prepared = Vec::with_capacity(request.urls.len());
        for (index, raw) in request.urls.iter().enumerate() {
            match self.prepare_embed(index, raw, request.fallback_strategy) {
                Ok(item) => prepared.push(item),
                Err(failure) => {
                    warn!(index, reason = %failure.reason, "bulk embed input rejected");
                    result.failures.push(failure);
                }
            }
        }

        let mut processing = Duration::ZERO;
        let mut processed = 0usize;

        for (batch, chunk) in prepared.chunks(batch_size).enumerate() {
            let batch_started = Instant::now();
            let batch_countries: Vec<String> = chunk.iter().filter_map(|item| country_for(item.index)).collect();
            self.mesh.ensure_country_pools(&batch_countries).await;

            for item in chunk {
                let item_started = Instant::now();
                let session_id = new_session_id();
                let requirement = ProxyRequirement {
                    countries: country_for(item.index).into_iter().collect(),
                    sticky: request.sticky,
                    ..ProxyRequirement::default()
                };
                let assignment = self.mesh.assign_or_fallback(&session_id, &requirement, None).await;

                let mut definition = SessionDefinition::new(item.url.clone());
                definition.id = Some(session_id.clone());
                definition.target.label = request
                    .label_prefix
                    .as_ref()
                    .map(|prefix| format!("{prefix} #{}", item.index));
                definition.target.geo_affinity = request.geo_affinity.clone();
                definition.target.proxy = Some(requirement);
                definition.policy.target_replica_count = request.target_replica_count;
                definition.tags = request.tags.clone();
                definition.metadata.insert(
                    PROXY_NODE_METADATA_KEY.to_string(),
                    serde_json::Value::String(assignment.node.id.clone()),
                );
                if let Some(imprint) = &item.imprint {
                    definition.metadata.insert(
                        CONTENT_IMPRINT_METADATA_KEY.to_string(),
                        serde_json::Value::String(imprint.clone()),
                    );
                }

                match self.upsert(definition).await {
                    Ok(blueprint) => result.successes.push(BulkEmbedSuccess {
                        index: item.index,
                        session_id: blueprint.id,
                        url: item.url.clone(),
                        proxy_id: assignment.node.id,
                        fallback_proxy: assignment.fallback,
                        substituted: item.imprint.is_some(),
                    }),
                    Err(e) => {
                        warn!(index = item.index, error = %e, "bulk embed session not created");
                        if let Err(release) = self.mesh.release_proxy(&session_id).await {
                            debug!(%session_id, error = %release, "no proxy to release");
                        }
                        result.failures.push(BulkFailure {
                            index: item.index,
                            input: Some(item.url.clone()),
                            reason: e.to_string(),
                        });
                    }
                }
                processing += item_started.elapsed();
                processed += 1;
            }

            result.batches += 1;
            info!(
                batch,
                size = chunk.len(),
                elapsed_ms = batch_started.elapsed().as_millis() as u64,
                "bulk embed batch done"
            );
            tokio::task::yield_now().await;
        }

        result.average_processing_ms = processing.as_secs_f64() * 1_000.0 / processed.max(1) as f64;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            total = result.total,
            successes = result.successes.len(),
            failures = result.failures.len(),
            batches = result.batches,
            elapsed_ms = result.elapsed_ms,
            "bulk embeds complete"
        );
        result
    }

    /// Grow the registry to `target` sessions with synthetic embeds.
    pub async fn scale_to_million(&self, target: u64) -> ScaleResult {
        let started = Instant::now();
        let initial_count = self.session_count().await as u64;

        if initial_count >= target {
            debug!(target, current = initial_count, "scale-out target already met");
            return ScaleResult {
                target,
                initial_count,
                final_count: initial_count,
                created: 0,
                failed: 0,
                batch_size: 0,
                target_reached: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        let delta = target - initial_count;
        let batch_size = scale_batch_size(delta);
        info!(target, current = initial_count, delta, batch_size, "scaling out");

        let request = BulkEmbedRequest {
            urls: (0..delta).map(|i| self.content.sequence_url(initial_count + i)).collect(),
            label_prefix: Some("scale".to_string()),
            countries: self.config.scale_countries.clone(),
            tags: vec!["scale".to_string()],
            batch_size: Some(batch_size),
            ..BulkEmbedRequest::default()
        };
        let bulk = self.create_bulk_embeds(request).await;

        let final_count = self.session_count().await as u64;
        let target_reached = final_count as f64 >= target as f64 * SCALE_TARGET_TOLERANCE;
        if !target_reached {
            warn!(target, final_count, "scale-out fell short of target");
        }

        ScaleResult {
            target,
            initial_count,
            final_count,
            created: bulk.successes.len(),
            failed: bulk.failures.len(),
            batch_size,
            target_reached,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
