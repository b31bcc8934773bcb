//! Shared test utilities for scenario, chaos and property tests.
//!
//! This module provides:
//! - Scripted MockTransport recording every call per (node, phase)
//! - Simulated receivers checksumming upload bodies
//! - Cluster and engine builders

pub mod mock_transport;

pub use mock_transport::*;

use cluster_replicator::{
    NodeConnectionState, NodeTarget, ReplicationEngine, ReplicatorConfig, StaticNodeRegistry,
};
use std::sync::Arc;

/// Registry with `connected` connected nodes named node-1..node-N, followed
/// by `disconnected` disconnected ones.
pub fn cluster(connected: usize, disconnected: usize) -> Arc<StaticNodeRegistry> {
    let registry = StaticNodeRegistry::new();
    for i in 1..=connected + disconnected {
        let state = if i <= connected {
            NodeConnectionState::Connected
        } else {
            NodeConnectionState::Disconnected
        };
        registry.upsert(NodeTarget::new(
            format!("node-{i}"),
            format!("http://10.0.0.{i}:8080"),
            state,
        ));
    }
    Arc::new(registry)
}

/// Engine with test timeouts, coordinating from node-1.
pub fn engine(registry: Arc<StaticNodeRegistry>, transport: Arc<MockTransport>) -> ReplicationEngine {
    engine_with(ReplicatorConfig::for_testing("node-1"), registry, transport)
}

pub fn engine_with(
    config: ReplicatorConfig,
    registry: Arc<StaticNodeRegistry>,
    transport: Arc<MockTransport>,
) -> ReplicationEngine {
    ReplicationEngine::new(config, registry, transport).expect("valid test config")
}
