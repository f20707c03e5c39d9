//! Worker pool manager interface.
//!
//! Provisioning real worker processes (container replicas, VM instances)
//! is deployment-specific and lives outside this crate; the controller
//! only ever talks to this trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::job::JobType;

use super::ScaleError;

/// External collaborator that creates and destroys worker instances.
#[async_trait]
pub trait WorkerPoolManager: Send + Sync {
    /// Actual replica count for a class. Read fresh on every controller
    /// tick; manual operator overrides are picked up at the next tick.
    async fn replica_count(&self, class: JobType) -> Result<u32, ScaleError>;

    /// Sets the desired replica count for a class.
    async fn set_replica_count(&self, class: JobType, count: u32) -> Result<(), ScaleError>;
}

/// Pool manager that only tracks desired counts in memory.
///
/// Stands in for a real provisioner in tests and single-machine
/// deployments where workers are managed out of band.
pub struct InMemoryPoolManager {
    replicas: Mutex<BTreeMap<JobType, u32>>,
    initial_replicas: u32,
}

impl InMemoryPoolManager {
    pub fn new(initial_replicas: u32) -> Self {
        Self {
            replicas: Mutex::new(BTreeMap::new()),
            initial_replicas,
        }
    }
}

#[async_trait]
impl WorkerPoolManager for InMemoryPoolManager {
    async fn replica_count(&self, class: JobType) -> Result<u32, ScaleError> {
        let replicas = self.replicas.lock().expect("pool lock poisoned");
        Ok(replicas.get(&class).copied().unwrap_or(self.initial_replicas))
    }

    async fn set_replica_count(&self, class: JobType, count: u32) -> Result<(), ScaleError> {
        let mut replicas = self.replicas.lock().expect("pool lock poisoned");
        replicas.insert(class, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_defaults_and_overrides() {
        let pool = InMemoryPoolManager::new(2);
        assert_eq!(pool.replica_count(JobType::Analysis).await.unwrap(), 2);

        pool.set_replica_count(JobType::Analysis, 5).await.unwrap();
        assert_eq!(pool.replica_count(JobType::Analysis).await.unwrap(), 5);
        // Other classes keep the default.
        assert_eq!(pool.replica_count(JobType::Generation).await.unwrap(), 2);
    }
}
