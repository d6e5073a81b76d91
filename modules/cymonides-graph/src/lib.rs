pub mod client;
pub mod error;
pub mod memory;
pub mod merge;
pub mod migrate;
pub mod postgres;
pub mod reader;
pub mod rollback;
pub mod store;
pub mod tags;
pub mod verification;
pub mod writer;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use error::GraphError;
pub use memory::MemoryStore;
pub use merge::{merge_into, MergeChanges};
pub use migrate::migrate;
pub use postgres::PgNodeStore;
pub use reader::{GraphReader, QueueEntry, VerifiedPeer};
pub use rollback::RollbackStats;
pub use store::{NodeFilter, NodeStore, StoreError, Versioned};
pub use tags::{normalize_tag, TagQuery};
pub use verification::{FollowUpClaim, UpgradeOutcome};
pub use writer::{
    GraphWriter, MergeOutcome, RetryPolicy, UpdateOutcome, UpsertError, UpsertErrorKind,
    UpsertResult,
};
