//! Language-model dispatch: the client contract, the resilient wrapper
//! around it, and post-processing of free-form responses into JSON.

pub mod client;
pub mod events;
pub mod extract;
pub mod processor;
pub mod repair;

pub use client::{BatchDispatcher, LlmClient, ResilientClient, ResilientRequest, ResilientResponse};
pub use events::{
    BatchStats, EventSink, RecordingEventSink, RequestScope, SinkEvent, TracingEventSink,
};
pub use extract::extract_json;
pub use processor::{ProcessError, Processed, process_llm_response};
pub use repair::{RepairError, RepairStats, Repaired, repair_json};
