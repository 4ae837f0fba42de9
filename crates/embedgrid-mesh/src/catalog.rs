//! Country blueprints and deterministic node generation.
//!
//! A small static catalog covers the seed countries. Any other ISO code is
//! synthesized on demand from a fallback blueprint picked by hashing the
//! code, then perturbed by a SHA-256-seeded generator. Both synthesis and
//! node generation are pure functions of the country code, so a pool
//! rebuilt after a restart is identical to the one it replaces.

use serde::{Deserialize, Serialize};

use embedgrid_model::seed::{read_u32_be, sha256_digest};
use embedgrid_model::{Mulberry32, ProxyProtocol};

use crate::config::MeshConfig;
use crate::types::{NodeStatus, PoolPriorities, ProxyNode, ProxyPool, RotationStrategy};

/// Synthesized countries never get fewer nodes than this.
pub const MIN_SYNTHESIZED_NODES: u32 = 32;

/// Shape of the pool materialized for one country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryBlueprint {
    pub country_code: String,
    pub region: String,
    pub node_count: u32,
    pub max_concurrent_per_node: u32,
    pub base_latency_ms: f64,
    pub base_reliability: f64,
    /// Preferred protocol first.
    pub protocols: Vec<ProxyProtocol>,
    pub endpoint_domain: String,
}

struct StaticEntry {
    code: &'static str,
    region: &'static str,
    nodes: u32,
    concurrency: u32,
    latency_ms: f64,
    reliability: f64,
    protocols: &'static [ProxyProtocol],
}

use ProxyProtocol::{Http, Https, Socks5};

const STATIC_CATALOG: &[StaticEntry] = &[
    StaticEntry { code: "US", region: "us-east", nodes: 96, concurrency: 64, latency_ms: 42.0, reliability: 0.985, protocols: &[Https, Http, Socks5] },
    StaticEntry { code: "CA", region: "us-east", nodes: 48, concurrency: 48, latency_ms: 55.0, reliability: 0.982, protocols: &[Https, Http] },
    StaticEntry { code: "BR", region: "sa-east", nodes: 48, concurrency: 40, latency_ms: 95.0, reliability: 0.965, protocols: &[Http, Https] },
    StaticEntry { code: "GB", region: "eu-west", nodes: 72, concurrency: 64, latency_ms: 48.0, reliability: 0.984, protocols: &[Https, Socks5, Http] },
    StaticEntry { code: "DE", region: "eu-central", nodes: 72, concurrency: 64, latency_ms: 46.0, reliability: 0.986, protocols: &[Https, Http, Socks5] },
    StaticEntry { code: "FR", region: "eu-west", nodes: 56, concurrency: 56, latency_ms: 50.0, reliability: 0.983, protocols: &[Https, Http] },
    StaticEntry { code: "NL", region: "eu-west", nodes: 56, concurrency: 56, latency_ms: 44.0, reliability: 0.987, protocols: &[Socks5, Https] },
    StaticEntry { code: "IN", region: "ap-south", nodes: 64, concurrency: 48, latency_ms: 110.0, reliability: 0.962, protocols: &[Http, Https] },
    StaticEntry { code: "JP", region: "ap-northeast", nodes: 64, concurrency: 56, latency_ms: 78.0, reliability: 0.981, protocols: &[Https, Http] },
    StaticEntry { code: "KR", region: "ap-northeast", nodes: 48, concurrency: 48, latency_ms: 82.0, reliability: 0.979, protocols: &[Https, Socks5] },
    StaticEntry { code: "SG", region: "ap-southeast", nodes: 56, concurrency: 56, latency_ms: 70.0, reliability: 0.978, protocols: &[Https, Http, Socks5] },
    StaticEntry { code: "AU", region: "ap-southeast", nodes: 48, concurrency: 48, latency_ms: 120.0, reliability: 0.975, protocols: &[Https, Http] },
];

impl StaticEntry {
    fn to_blueprint(&self) -> CountryBlueprint {
        CountryBlueprint {
            country_code: self.code.to_string(),
            region: self.region.to_string(),
            node_count: self.nodes,
            max_concurrent_per_node: self.concurrency,
            base_latency_ms: self.latency_ms,
            base_reliability: self.reliability,
            protocols: self.protocols.to_vec(),
            endpoint_domain: endpoint_domain(self.code),
        }
    }
}

fn endpoint_domain(code: &str) -> String {
    format!("{}.mesh.embedgrid.net", code.to_ascii_lowercase())
}

/// Look up `code` in the static catalog.
pub fn static_blueprint(code: &str) -> Option<CountryBlueprint> {
    STATIC_CATALOG
        .iter()
        .find(|e| e.code == code)
        .map(StaticEntry::to_blueprint)
}

/// Every blueprint in the static catalog.
pub fn static_catalog() -> Vec<CountryBlueprint> {
    STATIC_CATALOG.iter().map(StaticEntry::to_blueprint).collect()
}

/// Country codes in the static catalog.
pub fn static_country_codes() -> impl Iterator<Item = &'static str> {
    STATIC_CATALOG.iter().map(|e| e.code)
}

/// Derive a blueprint for a country outside the static catalog.
///
/// Perturbs a hash-selected fallback: node count ×[0.7, 1.5), per-node
/// concurrency ×[0.75, 1.35), latency ±10ms, reliability ±0.006, and a
/// rotated protocol order.
pub fn synthesize_blueprint(code: &str) -> CountryBlueprint {
    let digest = sha256_digest(code);
    let fallback = &STATIC_CATALOG[read_u32_be(&digest, 0) as usize % STATIC_CATALOG.len()];
    let mut rng = Mulberry32::from_sha256(&format!("{code}:blueprint"));

    let node_count = ((f64::from(fallback.nodes) * rng.range(0.7, 1.5)).round() as u32)
        .max(MIN_SYNTHESIZED_NODES);
    let max_concurrent_per_node =
        ((f64::from(fallback.concurrency) * rng.range(0.75, 1.35)).round() as u32).max(1);
    let base_latency_ms = (fallback.latency_ms + rng.range(-10.0, 10.0)).max(5.0);
    let base_reliability = (fallback.reliability + rng.range(-0.006, 0.006)).clamp(0.5, 0.999);

    let mut protocols = fallback.protocols.to_vec();
    let shift = rng.next_u32() as usize % protocols.len().max(1);
    protocols.rotate_left(shift);

    CountryBlueprint {
        country_code: code.to_string(),
        region: fallback.region.to_string(),
        node_count,
        max_concurrent_per_node,
        base_latency_ms,
        base_reliability,
        protocols,
        endpoint_domain: endpoint_domain(code),
    }
}

/// Generate the nodes of a country pool. Deterministic per blueprint.
pub fn generate_nodes(blueprint: &CountryBlueprint) -> Vec<ProxyNode> {
    let code = &blueprint.country_code;
    let lower = code.to_ascii_lowercase();

    (0..blueprint.node_count)
        .map(|index| {
            let digest = sha256_digest(&format!("{code}:node:{index}"));
            let endpoint_shard = digest[0] % 16;
            let port = 10_000 + u16::from_be_bytes([digest[1], digest[2]]) % 20_000;
            let latency_jitter = f64::from(digest[3]) / 255.0 * 30.0 - 15.0;
            let reliability_jitter = f64::from(digest[4]) / 255.0 * 0.02 - 0.01;
            let protocol = blueprint
                .protocols
                .get(usize::from(digest[5]) % blueprint.protocols.len().max(1))
                .copied()
                .unwrap_or(ProxyProtocol::Http);
            let reliability = (blueprint.base_reliability + reliability_jitter).clamp(0.5, 0.999);

            ProxyNode {
                id: format!("{lower}-node-{index:04}"),
                endpoint: format!("edge-{endpoint_shard:02}.{}", blueprint.endpoint_domain),
                region: blueprint.region.clone(),
                country_code: code.clone(),
                protocol,
                port,
                latency_ms: (blueprint.base_latency_ms + latency_jitter).max(5.0),
                reliability,
                concurrent: 0,
                max_concurrent: blueprint.max_concurrent_per_node,
                status: NodeStatus::Active,
                tags: vec![
                    code.clone(),
                    blueprint.region.clone(),
                    protocol.as_str().to_string(),
                ],
                last_health_check: 0,
                error_count: 0,
                success_rate: reliability,
            }
        })
        .collect()
}

/// Pool id for a country code.
pub fn pool_id_for(code: &str) -> String {
    format!("pool-{}", code.to_ascii_lowercase())
}

/// Materialize the pool for `blueprint`, stamping every node as checked at `now_ms`.
pub fn build_pool(blueprint: &CountryBlueprint, config: &MeshConfig, now_ms: u64) -> ProxyPool {
    let mut nodes = generate_nodes(blueprint);
    for node in &mut nodes {
        node.last_health_check = now_ms;
    }
    ProxyPool {
        id: pool_id_for(&blueprint.country_code),
        name: format!("{} proxy pool", blueprint.country_code),
        region: blueprint.region.clone(),
        country_code: Some(blueprint.country_code.clone()),
        nodes,
        rotation_strategy: RotationStrategy::Performance,
        rotation_interval_ms: config.rotation_interval_ms,
        health_check_interval_ms: config.health_check_interval_ms,
        max_failures: config.max_failures,
        enable_geo_affinity: true,
        priorities: PoolPriorities::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us_has_96_nodes() {
        let us = static_blueprint("US").unwrap();
        assert_eq!(us.node_count, 96);
        assert_eq!(generate_nodes(&us).len(), 96);
    }

    #[test]
    fn catalog_codes_are_unique_and_uppercase() {
        let codes: Vec<&str> = static_country_codes().collect();
        let mut deduped = codes.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(codes.len(), deduped.len());
        assert!(codes.iter().all(|c| c.len() == 2 && c.chars().all(|ch| ch.is_ascii_uppercase())));
    }

    #[test]
    fn synthesized_blueprint_is_reproducible() {
        let a = synthesize_blueprint("ZZ");
        let b = synthesize_blueprint("ZZ");
        assert_eq!(a, b);
        assert!(a.node_count >= MIN_SYNTHESIZED_NODES);
        assert_eq!(a.country_code, "ZZ");
        assert_eq!(a.endpoint_domain, "zz.mesh.embedgrid.net");
    }

    #[test]
    fn synthesized_blueprint_stays_within_perturbation_bounds() {
        for code in ["ZZ", "QA", "MX", "NG", "AR", "EG", "VN", "PL"] {
            let bp = synthesize_blueprint(code);
            let fallback = STATIC_CATALOG
                .iter()
                .find(|e| e.region == bp.region && {
                    let lo = (f64::from(e.nodes) * 0.7).round() as u32;
                    let hi = (f64::from(e.nodes) * 1.5).round() as u32;
                    (lo.max(MIN_SYNTHESIZED_NODES)..=hi).contains(&bp.node_count)
                });
            assert!(fallback.is_some(), "{code} has no plausible fallback");
            assert!((0.5..=0.999).contains(&bp.base_reliability));
            assert!(!bp.protocols.is_empty());
        }
    }

    #[test]
    fn generated_nodes_are_byte_identical_across_calls() {
        let bp = synthesize_blueprint("ZZ");
        let a = serde_json::to_vec(&generate_nodes(&bp)).unwrap();
        let b = serde_json::to_vec(&generate_nodes(&bp)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn generated_nodes_have_expected_shape() {
        let bp = static_blueprint("DE").unwrap();
        let nodes = generate_nodes(&bp);
        assert_eq!(nodes[0].id, "de-node-0000");
        for node in &nodes {
            assert!((10_000..30_000).contains(&node.port));
            assert!((node.latency_ms - bp.base_latency_ms).abs() <= 15.0 + 1e-9);
            assert!(node.endpoint.ends_with(".de.mesh.embedgrid.net"));
            assert!(bp.protocols.contains(&node.protocol));
            assert_eq!(node.max_concurrent, bp.max_concurrent_per_node);
            assert_eq!(node.status, NodeStatus::Active);
        }
    }

    #[test]
    fn build_pool_stamps_health_check() {
        let bp = static_blueprint("JP").unwrap();
        let pool = build_pool(&bp, &MeshConfig::default(), 42);
        assert_eq!(pool.id, "pool-jp");
        assert_eq!(pool.country_code.as_deref(), Some("JP"));
        assert!(pool.nodes.iter().all(|n| n.last_health_check == 42));
    }
}
