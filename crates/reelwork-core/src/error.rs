use serde::Serialize;

/// Failure of one external service call. `code` is a stable `E_*` string,
/// `message` is short and human readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceError {
    pub code: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(CODE_CANCELLED, "cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == CODE_CANCELLED
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceError {}

pub const CODE_SPAWN_FAILED: &str = "E_SPAWN_FAILED";
pub const CODE_SPAWN_NOT_FOUND: &str = "E_SPAWN_NOT_FOUND";
pub const CODE_PROCESS_FAILED: &str = "E_PROCESS_FAILED";
pub const CODE_RESOURCE_BUSY: &str = "E_RESOURCE_BUSY";
pub const CODE_CANCELLED: &str = "E_CANCELLED";
pub const CODE_IO: &str = "E_IO";
pub const CODE_INTERNAL: &str = "E_INTERNAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The process could not be started.
    Spawn {
        program: String,
        not_found: bool,
        message: String,
    },
    /// The process ran and exited with a non-zero code. `tail` holds the last
    /// diagnostic lines it printed.
    ProcessFailed { exit_code: i32, tail: Vec<String> },
    Service(ServiceError),
    /// Rejected before any work started.
    ResourceBusy { resource: String, holder: String },
    Cancelled,
    Io { context: String, message: String },
    Internal(String),
}

impl TaskError {
    pub fn code(&self) -> &str {
        match self {
            TaskError::Spawn { not_found, .. } => {
                if *not_found {
                    CODE_SPAWN_NOT_FOUND
                } else {
                    CODE_SPAWN_FAILED
                }
            }
            TaskError::ProcessFailed { .. } => CODE_PROCESS_FAILED,
            TaskError::Service(e) => e.code.as_str(),
            TaskError::ResourceBusy { .. } => CODE_RESOURCE_BUSY,
            TaskError::Cancelled => CODE_CANCELLED,
            TaskError::Io { .. } => CODE_IO,
            TaskError::Internal(_) => CODE_INTERNAL,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            TaskError::Cancelled => true,
            TaskError::Service(e) => e.is_cancelled(),
            _ => false,
        }
    }

    pub fn io(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        TaskError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        TaskError::Internal(err.to_string())
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Spawn {
                program, message, ..
            } => write!(f, "failed to start {program}: {message}"),
            TaskError::ProcessFailed { exit_code, tail } => {
                write!(f, "process exited with code {exit_code}")?;
                if let Some(last) = tail.iter().rev().find(|l| !l.trim().is_empty()) {
                    write!(f, ": {}", last.trim())?;
                }
                Ok(())
            }
            TaskError::Service(e) => write!(f, "service call failed: {e}"),
            TaskError::ResourceBusy { resource, holder } => {
                write!(f, "resource {resource} is busy (held by task {holder})")
            }
            TaskError::Cancelled => write!(f, "cancelled"),
            TaskError::Io { context, message } => write!(f, "{context}: {message}"),
            TaskError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<ServiceError> for TaskError {
    fn from(e: ServiceError) -> Self {
        if e.is_cancelled() {
            return TaskError::Cancelled;
        }
        TaskError::Service(e)
    }
}
