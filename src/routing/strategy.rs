//! Server selection policy.
//!
//! The strategy is the only source of ordering policy: the load balancer
//! never sorts or shuffles the table's slices, it just asks the strategy to
//! pick from them.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::ServerAddress;

/// Capability interface for picking a server per access mode.
pub trait LoadBalancingStrategy: Send + Sync + Debug {
    fn select_reader(&self, readers: &[ServerAddress]) -> Option<ServerAddress>;
    fn select_writer(&self, writers: &[ServerAddress]) -> Option<ServerAddress>;
}

/// Default strategy: one rotating index per role, reduced modulo the
/// current slice length so removals simply wrap.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    reader_index: AtomicUsize,
    writer_index: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        RoundRobinStrategy::default()
    }

    fn pick(index: &AtomicUsize, addresses: &[ServerAddress]) -> Option<ServerAddress> {
        if addresses.is_empty() {
            return None;
        }
        let next = index.fetch_add(1, Ordering::Relaxed);
        Some(addresses[next % addresses.len()].clone())
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_reader(&self, readers: &[ServerAddress]) -> Option<ServerAddress> {
        Self::pick(&self.reader_index, readers)
    }

    fn select_writer(&self, writers: &[ServerAddress]) -> Option<ServerAddress> {
        Self::pick(&self.writer_index, writers)
    }
}
