//! Errors raised while placing and publishing code.
use thiserror::Error;

/// Error type describing things that can go wrong when mapping or
/// protecting executable memory.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodeMemoryError {
    /// The request on its own or together with the code already mapped
    /// would go over the process code budget.
    #[error("code allocation of {requested} bytes exceeds the process budget ({allocated} of {max} bytes in use)")]
    BudgetExceeded {
        /// Rounded size of the request.
        requested: usize,
        /// Bytes mapped when the request was made.
        allocated: usize,
        /// The process budget.
        max: usize,
    },
    /// Low level error with mmap.
    #[error("Error when allocating executable memory: {0}")]
    Region(String),
    /// Changing the protection of code pages failed.
    #[error("Error when changing code protection: {0}")]
    Protect(String),
}

/// An error while compiling, linking or publishing code.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A compilation error occured.
    #[error("Compilation error: {0}")]
    Codegen(String),

    /// Insufficient resources available for execution.
    #[error("Insufficient resources: {0}")]
    Resource(String),

    /// Executable memory could not be provided.
    #[error(transparent)]
    Memory(#[from] CodeMemoryError),
}

/// A background task could not be handed to a helper thread.
#[derive(Error, Debug)]
#[error("failed to schedule `{task}`: {reason}")]
pub struct ScheduleError {
    /// Name of the task.
    pub task: String,
    /// Why it could not be scheduled.
    pub reason: String,
}
