//! Background health-check and rotation sweeps.
//!
//! Each sweep is a single idempotent pass over shared state, so a slow
//! sweep overlapping the next tick only repeats work. The `run_*` loops
//! drive them on an interval until the shutdown channel flips.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use embedgrid_model::epoch_millis;

use crate::hooks::ProbeOutcome;
use crate::manager::{ProxyMeshManager, RotationOutcome};
use crate::types::{MeshEvent, NodeStatus, ProxyNode};

/// Summary of one health-check sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSweepStats {
    pub checked: usize,
    pub failed: usize,
    /// Nodes in maintenance, left untouched.
    pub skipped: usize,
}

/// Summary of one rotation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationSweepStats {
    pub rotated: usize,
    pub skipped_sticky: usize,
    pub fell_back: usize,
    pub failed: usize,
}

impl ProxyMeshManager {
    /// Probe every non-maintenance node once.
    ///
    /// Probing runs outside the pool lock; results are applied afterwards
    /// to whichever nodes still exist.
    pub async fn health_check_sweep(&self) -> HealthSweepStats {
        let mut stats = HealthSweepStats::default();

        let targets: Vec<(String, ProxyNode)> = {
            let pools = self.pools.read().await;
            pools
                .values()
                .flat_map(|pool| pool.nodes.iter().map(move |n| (pool.id.clone(), n.clone())))
                .filter(|(_, node)| {
                    if node.status == NodeStatus::Maintenance {
                        stats.skipped += 1;
                        false
                    } else {
                        true
                    }
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (pool_id, node) in &targets {
            outcomes.push((pool_id, &node.id, self.probe.probe(node).await));
        }

        let now = epoch_millis();
        let mut pools = self.pools.write().await;
        for (pool_id, node_id, outcome) in outcomes {
            let Some(pool) = pools.get_mut(pool_id) else {
                continue;
            };
            let max_failures = pool.max_failures;
            let Some(node) = pool.nodes.iter_mut().find(|n| &n.id == node_id) else {
                continue;
            };
            if node.status == NodeStatus::Maintenance {
                stats.skipped += 1;
                continue;
            }

            stats.checked += 1;
            node.last_health_check = now;
            match outcome {
                // Status and failure count belong to the probe and operators.
                ProbeOutcome::Healthy => {}
                ProbeOutcome::Unhealthy(reason) => {
                    stats.failed += 1;
                    node.error_count += 1;
                    debug!(pool = %pool_id, node = %node_id, %reason, errors = node.error_count, "proxy probe failed");
                    if node.error_count >= max_failures && node.status != NodeStatus::Error {
                        node.status = NodeStatus::Error;
                        warn!(pool = %pool_id, node = %node_id, "proxy node marked error");
                        self.emit(MeshEvent::NodeFailed {
                            pool_id: pool_id.clone(),
                            node_id: node_id.clone(),
                        });
                    }
                }
            }
        }
        stats
    }

    /// Rotate every non-sticky binding idle for at least `rotation_interval_ms`.
    pub async fn rotation_sweep(&self, now_ms: u64) -> RotationSweepStats {
        let mut stats = RotationSweepStats::default();
        let max_age = self.config.rotation_interval_ms;

        let mut pools = self.pools.write().await;
        let mut sessions = self.sessions.write().await;

        let due: Vec<String> = sessions
            .values()
            .filter(|s| {
                if s.sticky {
                    stats.skipped_sticky += 1;
                    false
                } else {
                    now_ms.saturating_sub(s.last_used_at) >= max_age
                }
            })
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in due {
            match self.rotate_locked(&mut pools, &mut sessions, &session_id, now_ms) {
                Ok(RotationOutcome::Sticky { .. }) => stats.skipped_sticky += 1,
                Ok(RotationOutcome::Fallback { .. }) => {
                    stats.rotated += 1;
                    stats.fell_back += 1;
                }
                Ok(_) => stats.rotated += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(%session_id, error = %e, "rotation failed");
                }
            }
        }
        stats
    }

    /// Run health sweeps every `health_check_interval_ms` until shutdown.
    pub async fn run_health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; the pools were just stamped.
        interval.tick().await;

        info!(interval_ms = self.config.health_check_interval_ms, "health sweep loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.health_check_sweep().await;
                    debug!(checked = stats.checked, failed = stats.failed, skipped = stats.skipped, "health sweep complete");
                }
                _ = shutdown.changed() => {
                    info!("health sweep loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run rotation sweeps every `rotation_interval_ms / 2` until shutdown.
    pub async fn run_rotation_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis((self.config.rotation_interval_ms / 2).max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        info!(interval_ms = period.as_millis() as u64, "rotation sweep loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.rotation_sweep(epoch_millis()).await;
                    debug!(
                        rotated = stats.rotated,
                        sticky = stats.skipped_sticky,
                        fell_back = stats.fell_back,
                        failed = stats.failed,
                        "rotation sweep complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("rotation sweep loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use embedgrid_model::ProxyRequirement;

    use super::*;
    use crate::config::MeshConfig;
    use crate::hooks::{BoxFuture, HealthProbe};

    struct FailingProbe {
        calls: AtomicUsize,
    }

    impl HealthProbe for FailingProbe {
        fn probe<'a>(&'a self, _node: &'a ProxyNode) -> BoxFuture<'a, ProbeOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { ProbeOutcome::Unhealthy("connect refused".to_string()) })
        }
    }

    fn countries(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn health_sweep_touches_nodes_and_skips_maintenance() {
        let mesh = ProxyMeshManager::new(MeshConfig::default());
        mesh.ensure_country_pools(&countries(&["CA"])).await;
        mesh.set_node_status("pool-ca", "ca-node-0000", NodeStatus::Maintenance)
            .await
            .unwrap();
        {
            let mut pools = mesh.pools.write().await;
            for node in &mut pools.get_mut("pool-ca").unwrap().nodes {
                node.last_health_check = 0;
            }
        }

        let stats = mesh.health_check_sweep().await;
        assert_eq!(stats.checked, 47);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);

        let pool = mesh.pool("pool-ca").await.unwrap();
        assert_eq!(pool.nodes[0].last_health_check, 0);
        assert!(pool.nodes[1..].iter().all(|n| n.last_health_check > 0));
    }

    #[tokio::test]
    async fn healthy_sweep_keeps_node_status() {
        let mesh = ProxyMeshManager::new(MeshConfig::default());
        mesh.ensure_country_pools(&countries(&["US"])).await;
        mesh.set_node_status("pool-us", "us-node-0000", NodeStatus::Error)
            .await
            .unwrap();
        {
            let mut pools = mesh.pools.write().await;
            let nodes = &mut pools.get_mut("pool-us").unwrap().nodes;
            nodes[0].last_health_check = 0;
            nodes[1].error_count = 2;
            nodes[1].last_health_check = 0;
        }

        let stats = mesh.health_check_sweep().await;
        assert_eq!(stats.failed, 0);

        let pool = mesh.pool("pool-us").await.unwrap();
        assert_eq!(pool.nodes[0].status, NodeStatus::Error);
        assert!(pool.nodes[0].last_health_check > 0);
        assert_eq!(pool.nodes[1].error_count, 2);
        assert!(pool.nodes[1].last_health_check > 0);
    }

    #[tokio::test]
    async fn failing_probe_marks_node_error_after_max_failures() {
        let probe = Arc::new(FailingProbe {
            calls: AtomicUsize::new(0),
        });
        let mesh = ProxyMeshManager::new(MeshConfig::default()).with_probe(probe.clone());
        mesh.ensure_country_pools(&countries(&["KR"])).await;
        let mut events = mesh.subscribe();

        for _ in 0..2 {
            mesh.health_check_sweep().await;
        }
        let pool = mesh.pool("pool-kr").await.unwrap();
        assert!(pool.nodes.iter().all(|n| n.status == NodeStatus::Active && n.error_count == 2));

        let stats = mesh.health_check_sweep().await;
        assert_eq!(stats.failed, 48);
        let pool = mesh.pool("pool-kr").await.unwrap();
        assert!(pool.nodes.iter().all(|n| n.status == NodeStatus::Error));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 48 * 3);
        assert!(matches!(events.try_recv(), Ok(MeshEvent::NodeFailed { .. })));
    }

    #[tokio::test]
    async fn rotation_sweep_rotates_idle_non_sticky() {
        let config = MeshConfig {
            rotation_interval_ms: 1_000,
            ..MeshConfig::default()
        };
        let mesh = ProxyMeshManager::new(config);
        let plain = ProxyRequirement {
            countries: countries(&["DE"]),
            ..ProxyRequirement::default()
        };
        let sticky = ProxyRequirement {
            sticky: true,
            ..plain.clone()
        };
        mesh.assign_proxy("plain", &plain, None).await.unwrap();
        mesh.assign_proxy("sticky", &sticky, None).await.unwrap();
        let assigned_at = mesh.binding("plain").await.unwrap().assigned_at;

        let early = mesh.rotation_sweep(assigned_at + 10).await;
        assert_eq!(early.rotated, 0);
        assert_eq!(early.skipped_sticky, 1);

        let later = assigned_at + 5_000;
        let stats = mesh.rotation_sweep(later).await;
        assert_eq!(stats.rotated, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(mesh.binding("plain").await.unwrap().assigned_at, later);
        assert_eq!(mesh.binding("sticky").await.unwrap().assigned_at, assigned_at);
        assert_eq!(mesh.get_proxy_metrics(Some("pool-de")).await.unwrap().used_capacity, 2);
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let config = MeshConfig {
            health_check_interval_ms: 10,
            rotation_interval_ms: 20,
            ..MeshConfig::default()
        };
        let mesh = Arc::new(ProxyMeshManager::new(config));
        mesh.ensure_country_pools(&countries(&["US"])).await;
        let (tx, rx) = watch::channel(false);

        let health = tokio::spawn({
            let mesh = mesh.clone();
            let rx = rx.clone();
            async move { mesh.run_health_loop(rx).await }
        });
        let rotation = tokio::spawn({
            let mesh = mesh.clone();
            async move { mesh.run_rotation_loop(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), health)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), rotation)
            .await
            .unwrap()
            .unwrap();
    }
}
