//! Tenant namespace bootstrap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::{LABEL_MANAGED_BY, MANAGED_BY_KEEL};
use keel_kubehub::ClusterError;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::info;

#[async_trait::async_trait]
pub trait NamespaceEnsurer: Send + Sync {
    /// Make sure `name` exists. An existing namespace is success.
    async fn ensure(&self, name: &str) -> Result<(), ClusterError>;
}

pub struct KubeNamespaces {
    client: Client,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl NamespaceEnsurer for KubeNamespaces {
    async fn ensure(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await.map_err(|e| ClusterError::from_kube(e, "Namespace", name))?.is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY_KEEL.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %name, "namespace created");
                Ok(())
            }
            Err(e) => match ClusterError::from_kube(e, "Namespace", name) {
                ClusterError::AlreadyExists { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// In-memory namespaces for tests.
#[derive(Default)]
pub struct MemoryNamespaces {
    existing: Mutex<BTreeSet<String>>,
    created: Mutex<Vec<String>>,
    failure: Mutex<Option<ClusterError>>,
}

impl MemoryNamespaces {
    pub fn new() -> Self { Self::default() }

    pub fn with_existing(names: &[&str]) -> Self {
        let ns = Self::default();
        ns.lock_existing().extend(names.iter().map(|n| n.to_string()));
        ns
    }

    pub fn fail_with(&self, err: ClusterError) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }

    pub fn exists(&self, name: &str) -> bool { self.lock_existing().contains(name) }

    /// Namespaces this fake had to create, in order.
    pub fn created(&self) -> Vec<String> { self.created.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    fn lock_existing(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.existing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl NamespaceEnsurer for MemoryNamespaces {
    async fn ensure(&self, name: &str) -> Result<(), ClusterError> {
        if let Some(err) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(err);
        }
        if self.lock_existing().insert(name.to_string()) {
            self.created.lock().unwrap_or_else(|p| p.into_inner()).push(name.to_string());
        }
        Ok(())
    }
}
