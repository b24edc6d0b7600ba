//! Metadata-service change hooks.
//!
//! Cluster metadata lives in an external key-value service. Components that
//! must learn about new shards or engines without a restart implement
//! [`MetadataHooks`] and are registered with that service at startup.

use crate::fragment::StorageUnitMeta;
use crate::storage::EngineSpec;

/// Change notifications delivered by the metadata service.
///
/// `before` is `None` on creation. Hooks run on the metadata service's
/// callback thread and must not block.
pub trait MetadataHooks: Send + Sync {
    fn on_storage_unit_created(&self, before: Option<&StorageUnitMeta>, after: &StorageUnitMeta);

    fn on_storage_engine_changed(&self, before: Option<&EngineSpec>, after: &EngineSpec);
}
