//! Worker lifecycle, supervision, intents, permissions, and context
//! management.

pub mod compaction;
pub mod conflict;
pub mod digest;
pub mod intents;
pub mod lifecycle;
pub mod permission;
pub mod supervisor;

pub use compaction::CompactionValidator;
pub use conflict::{ConflictDetector, ConflictType, FileConflict};
pub use digest::DigestBuilder;
pub use intents::IntentResolver;
pub use lifecycle::WorkerManager;
pub use permission::PermissionBroker;
pub use supervisor::{Supervisor, SupervisorConfig, TimeoutAction, TimeoutKind};
