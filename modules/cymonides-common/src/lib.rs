pub mod config;
pub mod error;
pub mod id;
pub mod ontology;
pub mod types;

pub use config::Config;
pub use error::CymonidesError;
pub use id::*;
pub use ontology::{build_discovery_edge, build_edge, classify_relation, Ontology};
pub use types::*;
