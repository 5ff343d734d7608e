//! Dispatch engine: registry, extensions, execution, deferred operations.
//!
//! A call flows through:
//!
//! 1. **Middleware** (`middleware`): load shedding, timeout, metrics
//! 2. **Dispatcher** (`dispatcher`): parse, validate, resolve, run hooks
//! 3. **Engine** (`engine`): sync, streamed, or deferred execution
//! 4. **Worker** (`worker`): runs deferred operations and expires stale ones

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod extension;
pub mod function;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod stream;
pub mod system;
pub mod worker;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchOutcome, DispatchService, Dispatcher, InboundCall};
pub use engine::{Execution, ExecutionEngine};
pub use error::DispatchError;
pub use extension::{
    DeprecationExtension, Extension, ExtensionPipeline, HookOutcome, InMemoryRateLimiter,
    LifecyclePoint, RateLimitExtension, RateLimiter, TimingExtension,
};
pub use function::{
    AsyncFunction, ExecutionMode, Function, FunctionDescriptor, Implementation, ItemStream,
    RegisteredFunction, StreamContext, StreamItem, StreamingFunction,
};
pub use middleware::{build_dispatch_pipeline, call_pipeline, DispatchPipeline};
pub use operation::{
    CancellationRegistry, InMemoryOperationRepository, JobContext, OperationJob,
    OperationRepository,
};
pub use registry::{FunctionRegistry, RegistryError};
pub use stream::ResultStream;
pub use system::register_system_functions;
pub use worker::{
    spawn_operation_worker, BackgroundRunnable, BackgroundWorker, OperationExecutor,
    OperationRunner, WorkerExecutor,
};
