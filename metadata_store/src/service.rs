//! Store for [`ServiceMetadata`] records and the tenant admin operations.

use crate::core::TypedStore;
use crate::interface::CoordinationStore;
use crate::{
    AutoAssignUnsupportedSnafu, InvalidEntitySnafu, InvalidThroughputSnafu, Result,
};
use backoff::BackoffConfig;
use data_types::{ServiceMetadata, THROUGHPUT_UNCHANGED};
use snafu::{ensure, ResultExt};
use std::sync::Arc;

/// Folder holding one node per provisioned tenant.
pub const SERVICE_STORE_FOLDER: &str = "/services";

/// Access to tenant provisioning records. Full CRUD.
///
/// Updates are compare-and-set on the node version read, so concurrent
/// admin operations cannot silently overwrite each other.
#[derive(Debug)]
pub struct ServiceMetadataStore {
    inner: TypedStore<ServiceMetadata>,
}

impl ServiceMetadataStore {
    /// Create a store rooted at [`SERVICE_STORE_FOLDER`].
    pub async fn new(store: Arc<dyn CoordinationStore>, backoff_config: BackoffConfig) -> Self {
        Self {
            inner: TypedStore::new(store, SERVICE_STORE_FOLDER, backoff_config).await,
        }
    }

    /// Provision a new tenant with no throughput and no partitions
    /// assigned. Fails if the name is taken.
    pub async fn create_service(&self, name: &str, owner: &str) -> Result<ServiceMetadata> {
        let service =
            ServiceMetadata::new(name, owner, 0, vec![]).context(InvalidEntitySnafu)?;
        self.inner.create(&service).await?;
        Ok(service)
    }

    /// Change the owner of an existing tenant.
    pub async fn update_owner(&self, name: &str, owner: &str) -> Result<ServiceMetadata> {
        let (mut service, version) = self.inner.get_with_version(name).await?;
        service.owner = owner.to_string();
        self.inner.update(&service, Some(version)).await?;
        Ok(service)
    }

    /// Replace a tenant's throughput budget and partition assignment.
    ///
    /// `throughput_bytes` of [`THROUGHPUT_UNCHANGED`] keeps the current
    /// budget. An empty `partition_ids` list would mean "pick partitions
    /// for me" and is rejected until an allocator exists.
    pub async fn update_partition_assignment(
        &self,
        name: &str,
        throughput_bytes: i64,
        partition_ids: Vec<String>,
    ) -> Result<ServiceMetadata> {
        ensure!(
            !partition_ids.is_empty(),
            AutoAssignUnsupportedSnafu { service: name }
        );

        let (mut service, version) = self.inner.get_with_version(name).await?;
        if throughput_bytes != THROUGHPUT_UNCHANGED {
            ensure!(
                throughput_bytes >= 0,
                InvalidThroughputSnafu { throughput_bytes }
            );
            service.throughput_bytes = throughput_bytes;
        }
        service.set_partition_ids(partition_ids);
        self.inner.update(&service, Some(version)).await?;
        Ok(service)
    }

    /// Fetch a tenant by name.
    pub async fn get(&self, name: &str) -> Result<ServiceMetadata> {
        self.inner.get(name).await
    }

    /// Remove a tenant. Errors if it does not exist.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }

    /// Point-in-time view of the cached tenant list.
    pub fn list_cached(&self) -> Vec<ServiceMetadata> {
        self.inner.list_cached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemCoordinationStore;
    use crate::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn store() -> ServiceMetadataStore {
        let mem: Arc<dyn CoordinationStore> = Arc::new(MemCoordinationStore::new());
        ServiceMetadataStore::new(mem, BackoffConfig::default()).await
    }

    #[tokio::test]
    async fn provisioning_flow() {
        let services = store().await;

        let created = services.create_service("tenant-a", "team-obs").await.unwrap();
        assert_eq!(created.throughput_bytes, 0);
        assert!(created.partition_ids.is_empty());

        assert_matches!(
            services.create_service("tenant-a", "someone-else").await,
            Err(Error::AlreadyExists { .. })
        );

        let updated = services
            .update_partition_assignment("tenant-a", 4000, vec!["1".into(), "0".into()])
            .await
            .unwrap();
        assert_eq!(updated.throughput_bytes, 4000);
        assert_eq!(updated.partition_ids, vec!["0", "1"]);

        // sentinel keeps the budget, replaces the assignment
        let updated = services
            .update_partition_assignment("tenant-a", THROUGHPUT_UNCHANGED, vec!["2".into()])
            .await
            .unwrap();
        assert_eq!(updated.throughput_bytes, 4000);
        assert_eq!(updated.partition_ids, vec!["2"]);

        let renamed = services.update_owner("tenant-a", "team-infra").await.unwrap();
        assert_eq!(renamed.owner, "team-infra");
        assert_eq!(
            services.get("tenant-a").await.unwrap().owner,
            "team-infra"
        );
    }

    #[tokio::test]
    async fn empty_assignment_is_rejected() {
        let services = store().await;
        services.create_service("tenant-a", "team").await.unwrap();

        assert_matches!(
            services
                .update_partition_assignment("tenant-a", 1000, vec![])
                .await,
            Err(Error::AutoAssignUnsupported { .. })
        );
    }

    #[tokio::test]
    async fn invalid_throughput_is_rejected() {
        let services = store().await;
        services.create_service("tenant-a", "team").await.unwrap();

        assert_matches!(
            services
                .update_partition_assignment("tenant-a", -7, vec!["0".into()])
                .await,
            Err(Error::InvalidThroughput {
                throughput_bytes: -7
            })
        );
    }

    #[tokio::test]
    async fn updates_against_missing_service_fail() {
        let services = store().await;
        assert_matches!(
            services.update_owner("nope", "team").await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            services
                .update_partition_assignment("nope", 10, vec!["0".into()])
                .await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn list_cached_sees_tenants() {
        let services = store().await;
        services.create_service("a", "team").await.unwrap();
        services.create_service("b", "team").await.unwrap();

        for _ in 0..500 {
            if services.list_cached().len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("cache did not catch up");
    }
}
