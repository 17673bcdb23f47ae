//! Workflow engine for the silver-telegram platform.
//!
//! This crate provides the core data model and execution primitives for
//! running browser-automation workflows:
//!
//! - **Data model**: workflows, steps, actions, and their runs
//! - **Variable resolution**: `{{...}}` token substitution against static,
//!   dynamic, runtime, and faker-generated values
//! - **Action registry**: resolves an action's type name to its
//!   implementation
//! - **Event pipeline**: buffers and broadcasts run events
//! - **Browser session**: the abstraction actions drive, implemented
//!   elsewhere

pub mod browser;
pub mod envelope;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod storage;

pub use browser::{BrowserError, BrowserSession, NullBrowserSession};
pub use envelope::{Envelope, RawEnvelope};
pub use model::{
    Action, LogEntry, LogLevel, LoopCondition, MultirunConfig, MultirunMode, NotificationConfig,
    OutputFileRef, Run, RunStatus, Step, VariableContext, VariableDefinition, VariableType,
    Workflow, WorkflowConfig,
};
pub use pipeline::{
    BroadcastRegistry, EventPipeline, EventPipelineHandle, EventSink, NullEventSink,
    PipelineError, RunEvent, SubscriptionKey,
};
pub use registry::{Action as ActionTrait, ActionError, ActionRegistry, RegistryError, RunContext};
pub use resolver::{ResolverError, VariableResolver};
pub use storage::{NullStorageService, StorageError, StorageService};
