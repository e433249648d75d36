//! Domain model (ids, tasks, messages, pipeline config, attempts, events, errors).
//!
//! Architecture-agnostic: nothing here knows about workers, channels or storage.

pub mod attempt;
pub mod errors;
pub mod events;
pub mod filter;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod stage;
pub mod task;

pub use attempt::{DeliveryAttempt, TimeRange};
pub use errors::{
    DeliveryError, ErrorKind, PlatformError, RegistryError, StageError, StoreError,
    TransformError,
};
pub use events::{TaskEvent, TaskEventKind};
pub use filter::{ContentFilter, FilterMode};
pub use ids::{AttemptId, MessageId, TaskId};
pub use message::{MediaRef, Message, Payload};
pub use outcome::{AttemptOutcome, DeliveryOutcome, DeliveryResult};
pub use stage::{
    FailurePolicy, PipelineConfig, ReplaceRule, StageConfig, StageKind, WatermarkPosition,
};
pub use task::{ChannelRef, ForwardingTask, PauseReason, TaskStatus, TaskSummary, Transition};
