pub mod checksum;
pub mod comparator;
pub mod engine;
pub mod models;
pub mod retry;
pub mod scanner;
pub mod staging;
pub mod transfer;

pub use comparator::{build_move_list, ListingComparator, ObjectRelation};
pub use engine::{
    SyncConfig, SyncEngine, SyncPhase, SyncPlan, SyncProgress, SyncReport, SyncRequest, SyncStatus,
};
pub use models::{EndpointRole, Listing, MoveList, ObjectRecord, ObjectTable};
pub use retry::{with_retry, RetryExhausted, RetryPolicy};
pub use scanner::{build_listing, ContainerFilter, ListingScanner};
pub use staging::StagingArea;
pub use transfer::{StagedFile, TransferPipeline};
