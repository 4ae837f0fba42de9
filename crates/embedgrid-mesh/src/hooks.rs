//! Extension points for failover and node health probing.
//!
//! The defaults do nothing interesting: [`NoFailover`] never finds a
//! replacement and [`TouchProbe`] reports every node healthy. Deployments
//! that front real proxies plug in their own implementations through
//! [`ProxyMeshManager::with_failover`](crate::ProxyMeshManager::with_failover)
//! and [`ProxyMeshManager::with_probe`](crate::ProxyMeshManager::with_probe).

use std::future::Future;
use std::pin::Pin;

use crate::types::{ProxyNode, ProxyPool, ProxySession};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of probing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

/// Checks whether a proxy node is reachable.
///
/// Called by the health sweep outside any mesh lock, so implementations
/// may perform real I/O.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, node: &'a ProxyNode) -> BoxFuture<'a, ProbeOutcome>;
}

/// Reports every node healthy; the sweep then only refreshes `lastHealthCheck`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TouchProbe;

impl HealthProbe for TouchProbe {
    fn probe<'a>(&'a self, _node: &'a ProxyNode) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(async { ProbeOutcome::Healthy })
    }
}

/// Finds a replacement node inside a pool once normal assignment has failed.
pub trait FailoverStrategy: Send + Sync {
    /// Returns the id of a node in `pool` to bind `session` to, if any.
    fn failover(&self, pool: &ProxyPool, session: &ProxySession) -> Option<String>;
}

/// Never fails over.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailover;

impl FailoverStrategy for NoFailover {
    fn failover(&self, _pool: &ProxyPool, _session: &ProxySession) -> Option<String> {
        None
    }
}
