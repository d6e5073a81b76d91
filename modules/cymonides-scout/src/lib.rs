pub mod budget;
pub mod cascade;
pub mod collector;
pub mod fixtures;
pub mod normalize;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use budget::{BudgetTracker, OperationCost};
pub use cascade::{CascadeController, CascadeSummary};
pub use collector::{Collector, CollectorPool};
pub use fixtures::FixtureCollector;
pub use normalize::{MentionedEntity, NormalizeError, Normalizer, Officer, UpstreamRecord};
pub use traits::{Discovery, EntitySearch, SearchOutcome};
