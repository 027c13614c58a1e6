//! Piezas compartidas por el daemon, el lair y la CLI.

pub mod config;
pub mod entity;
pub mod events;
pub mod gate;
pub mod heartbeat;
pub mod job;
pub mod metadata;
pub mod process;
pub mod results;
pub mod task;
pub mod template;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use entity::{Dataset, EntityId, EntityKind, EntityRef, Project};
pub use events::{dispatch, EntityEvent};
pub use gate::{Decision, TaskGate};
pub use heartbeat::{DeclareAlive, SupervisionError, SupervisionPaths, ACTIVE_GRACE};
pub use job::{Job, JobRecord, StatusFile};
pub use metadata::{Loaded, LockPolicy, Metadata, MetadataStore, StoreError};
pub use results::{ResultFiles, ResultIndex, ResultRecord, ResultRegistry};
pub use task::{Task, TaskTable};
pub use template::{bind_host, BackendConfig, BackendType, LaunchContext, TemplateError};
