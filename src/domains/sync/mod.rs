pub mod entity_merger;
pub mod remote_client;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod types;

pub use entity_merger::{DomainEntityMerger, EntityMerger, VersionedEntityMerger};
pub use remote_client::{HttpSyncClient, RemoteSyncClient};
pub use repository::{SqliteSyncStateRepository, SyncStateRepository};
pub use scheduler::SyncScheduler;
pub use service::{SyncOptions, SyncService, SyncServiceImpl};
pub use types::*;
