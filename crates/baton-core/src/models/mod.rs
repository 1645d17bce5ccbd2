pub mod artifacts;
pub mod plan;
pub mod remote_task;
pub mod step;

pub use artifacts::{ArtifactKind, Artifacts, MediaArtifact};
pub use plan::AccessConfig;
pub use remote_task::{RemoteTask, RemoteTaskStatus, TaskNotification, TaskRequest};
pub use step::{Step, StepEvent, StepStatus};
