//! Review pipeline: scorecard validation, weighted consensus, blockers.

pub mod blocker;
pub mod consensus;
pub mod schema;

pub use blocker::BlockerChecker;
pub use consensus::ConsensusEngine;
pub use schema::SchemaValidator;
