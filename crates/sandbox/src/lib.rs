//! Sandbox provisioning and lifecycle: the command runner, the docker and
//! kubernetes runtime adapters, the snapshot store, the session aggregate
//! store and the reaper.

pub mod lifecycle;
pub mod reaper;
pub mod runner;
pub mod runtime;
pub mod snapshot;
pub mod store;

pub use lifecycle::SandboxManager;
pub use reaper::{ReapReport, Reaper};
pub use runner::{CommandOutput, CommandRunner, RunOptions, RunnerEvent};
pub use runtime::{RuntimeAdapter, RuntimeProbe, SpawnedRuntime};
pub use snapshot::SnapshotStore;
pub use store::{ArtifactStore, ConversationStore, SessionStore};
