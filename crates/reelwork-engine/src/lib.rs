//! Background tasks over external processes and services, plus a
//! supervisor that starts and stops work on an external condition.

pub mod observer;
pub mod owner;
pub mod scheduler;
pub mod supervisor;
pub mod task;
pub mod tasks;

pub use observer::{Callbacks, ChannelObserver, TaskObserver};
pub use owner::CaptureOwner;
pub use scheduler::{Scheduler, SchedulerConfig, TaskHandle, TaskOutcome};
pub use supervisor::{
    ConditionSource, ConditionSupervisor, SupervisedOwner, SupervisorCommand, SupervisorConfig,
    SupervisorHandle, SupervisorState, WindowTitleCondition,
};
pub use task::{Task, TaskContext};
