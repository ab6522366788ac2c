pub mod error;
pub mod task;

pub use error::{ServiceError, TaskError};
pub use task::{
    OwnerId, ProgressTracker, ResourceKey, TaskEvent, TaskId, TaskKind, TaskOutput, TaskState,
};
