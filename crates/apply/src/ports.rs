//! External port assignment for TCP-exposed managed services.
//!
//! A service keeps its port for life: the live public Service is consulted before
//! the pool, and both happen under one lock so two deploys cannot race for a port.
//! NodePorts are cluster-wide, so fresh ports skip whatever any namespace's public
//! Service already holds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Service;
use keel_core::config::PortRange;
use keel_core::{ResourceNames, ServiceId, LABEL_MANAGED_BY, LABEL_ROLE, MANAGED_BY_KEEL};
use keel_kubehub::{ObjectApi, Selector};
use keel_render::network::node_port;
use metrics::counter;
use tracing::info;

use crate::error::PortError;

/// Source of fresh ports.
#[async_trait::async_trait]
pub trait PortPool: Send + Sync {
    /// A port for `holder` outside `in_use`; the same holder gets the same port back.
    async fn allocate(&self, holder: &str, in_use: &BTreeSet<i32>) -> Result<i32, PortError>;
    /// Record that `holder` already owns `port` in the cluster.
    async fn reserve(&self, holder: &str, port: i32) -> Result<(), PortError>;
    async fn release(&self, holder: &str);
}

/// Lowest-free allocation over a fixed range, held in process memory.
pub struct RangePortPool {
    range: PortRange,
    held: Mutex<BTreeMap<i32, String>>,
}

impl RangePortPool {
    pub fn new(range: PortRange) -> Self { Self { range, held: Mutex::new(BTreeMap::new()) } }

    fn held(&self) -> std::sync::MutexGuard<'_, BTreeMap<i32, String>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn in_use(&self) -> usize { self.held().len() }
}

#[async_trait::async_trait]
impl PortPool for RangePortPool {
    async fn allocate(&self, holder: &str, in_use: &BTreeSet<i32>) -> Result<i32, PortError> {
        let mut held = self.held();
        if let Some((port, _)) = held.iter().find(|(p, h)| h.as_str() == holder && !in_use.contains(p)) {
            return Ok(*port);
        }
        let free = (self.range.first as i32..=self.range.last as i32)
            .find(|p| !held.contains_key(p) && !in_use.contains(p));
        match free {
            Some(port) => {
                held.insert(port, holder.to_string());
                Ok(port)
            }
            None => Err(PortError::Exhausted { first: self.range.first, last: self.range.last }),
        }
    }

    async fn reserve(&self, holder: &str, port: i32) -> Result<(), PortError> {
        let mut held = self.held();
        match held.get(&port) {
            Some(h) if h != holder => Err(PortError::Taken { port, holder: h.clone() }),
            _ => {
                held.insert(port, holder.to_string());
                Ok(())
            }
        }
    }

    async fn release(&self, holder: &str) {
        self.held().retain(|_, h| h != holder);
    }
}

pub struct PortAllocator {
    services: Arc<dyn ObjectApi<Service>>,
    pool: Arc<dyn PortPool>,
    lock: tokio::sync::Mutex<()>,
}

impl PortAllocator {
    pub fn new(services: Arc<dyn ObjectApi<Service>>, pool: Arc<dyn PortPool>) -> Self {
        Self { services, pool, lock: tokio::sync::Mutex::new(()) }
    }

    fn holder(namespace: &str, id: &ServiceId) -> String { format!("{}/{}", namespace, id) }

    /// The service's existing port if its public Service has one, else a new one.
    pub async fn resolve(&self, namespace: &str, names: &ResourceNames, id: &ServiceId) -> Result<i32, PortError> {
        let _guard = self.lock.lock().await;
        let holder = Self::holder(namespace, id);
        let live = self.services.get(namespace, &names.public_service()).await?;
        if let Some(port) = live.as_ref().and_then(node_port) {
            self.pool.reserve(&holder, port).await?;
            counter!("ports_reused", 1u64);
            info!(service = %id, port, "reusing external port");
            return Ok(port);
        }
        let in_use = self.ports_in_cluster().await?;
        let port = self.pool.allocate(&holder, &in_use).await?;
        counter!("ports_allocated", 1u64);
        info!(service = %id, port, "allocated external port");
        Ok(port)
    }

    /// NodePorts of every Keel public Service, across all namespaces.
    async fn ports_in_cluster(&self) -> Result<BTreeSet<i32>, PortError> {
        let selector = Selector::labels(format!("{}={},{}=public", LABEL_MANAGED_BY, MANAGED_BY_KEEL, LABEL_ROLE));
        let live = self.services.list_all(&selector).await?;
        Ok(live.iter().filter_map(node_port).collect())
    }

    pub async fn release(&self, namespace: &str, id: &ServiceId) {
        let _guard = self.lock.lock().await;
        self.pool.release(&Self::holder(namespace, id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ManagedKind, ServiceSpec};
    use keel_kubehub::memory::MemoryApi;
    use keel_render::network::public_service;

    fn small_range() -> PortRange { PortRange { first: 30000, last: 30001 } }

    #[tokio::test]
    async fn pool_hands_out_lowest_free_and_reuses_per_holder() {
        let pool = RangePortPool::new(small_range());
        let none = BTreeSet::new();
        assert_eq!(pool.allocate("a", &none).await.unwrap(), 30000);
        assert_eq!(pool.allocate("b", &none).await.unwrap(), 30001);
        assert_eq!(pool.allocate("a", &none).await.unwrap(), 30000);
        assert!(matches!(pool.allocate("c", &none).await, Err(PortError::Exhausted { .. })));
        pool.release("a").await;
        assert_eq!(pool.allocate("c", &none).await.unwrap(), 30000);
    }

    #[tokio::test]
    async fn pool_skips_ports_taken_in_the_cluster() {
        let pool = RangePortPool::new(small_range());
        let taken: BTreeSet<i32> = [30000].into_iter().collect();
        assert_eq!(pool.allocate("a", &taken).await.unwrap(), 30001);
        assert!(matches!(pool.allocate("b", &taken).await, Err(PortError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn ports_held_in_other_namespaces_are_not_handed_out() {
        let services = Arc::new(MemoryApi::<Service>::new());
        let a = ServiceSpec::managed("cache-a", "team-a", ManagedKind::Redis, "7");
        let a_names = ResourceNames::for_service(&a.id);
        services.insert("team-a", public_service(&a, &a_names, "team-a", 30000));
        let alloc = PortAllocator::new(services, Arc::new(RangePortPool::new(PortRange::default())));

        let b = ServiceSpec::managed("cache-b", "team-b", ManagedKind::Redis, "7");
        let port = alloc.resolve("team-b", &ResourceNames::for_service(&b.id), &b.id).await.unwrap();
        assert_ne!(port, 30000);
    }

    #[tokio::test]
    async fn live_port_is_reused_before_pool() {
        let services = Arc::new(MemoryApi::<Service>::new());
        let spec = ServiceSpec::managed("db", "acme", ManagedKind::Postgres, "16");
        let names = ResourceNames::for_service(&spec.id);
        services.insert("acme", public_service(&spec, &names, "acme", 31555));
        let pool = Arc::new(RangePortPool::new(PortRange::default()));
        let alloc = PortAllocator::new(services.clone(), pool.clone());

        assert_eq!(alloc.resolve("acme", &names, &spec.id).await.unwrap(), 31555);
        assert_eq!(alloc.resolve("acme", &names, &spec.id).await.unwrap(), 31555);
        assert_eq!(pool.in_use(), 1);
        // The reused port is no longer free for anyone else.
        assert_ne!(pool.allocate("other", &BTreeSet::new()).await.unwrap(), 31555);
    }

    #[tokio::test]
    async fn concurrent_resolves_get_distinct_ports() {
        let services = Arc::new(MemoryApi::<Service>::new());
        let pool = Arc::new(RangePortPool::new(PortRange::default()));
        let alloc = Arc::new(PortAllocator::new(services, pool));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let alloc = alloc.clone();
            tasks.push(tokio::spawn(async move {
                let id = ServiceId::new(format!("db-{}", i));
                let names = ResourceNames::for_service(&id);
                alloc.resolve("acme", &names, &id).await.unwrap()
            }));
        }
        let mut ports = Vec::new();
        for t in tasks { ports.push(t.await.unwrap()); }
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), 8);
    }
}
