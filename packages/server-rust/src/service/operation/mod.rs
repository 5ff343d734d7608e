//! Deferred operations: the repository contract, the in-memory store, job
//! plumbing shared with the worker, and the `forrst.operation.*` functions.

pub mod cancellation;
pub mod functions;
pub mod job;
pub mod memory;
pub mod repository;

pub use cancellation::CancellationRegistry;
pub use functions::{OperationCancelFunction, OperationListFunction, OperationStatusFunction};
pub use job::{JobContext, OperationJob, ProgressReporter};
pub use memory::InMemoryOperationRepository;
pub use repository::{
    update_operation, ListQuery, OperationPage, OperationRepository, RepositoryError, UpdateError,
    DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
