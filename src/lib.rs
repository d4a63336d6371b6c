//! chatweave: a conversational flow automation runtime for messaging
//! channels.
//!
//! Operators author flows as directed graphs of typed nodes (messages,
//! buttons, lists, media, delays, conditions). When an inbound message
//! matches a trigger the engine walks the graph, keeping one resumable
//! session per user, until the graph halts, needs more input, or the loop
//! guard trips. A recurring scheduler replays flows and bulk sends for
//! recipient cohorts.

pub mod app;
pub mod channel;
pub mod config;
pub mod engine;
pub mod flow;
pub mod leads;
pub mod logger;
pub mod message;
pub mod schema;

pub use engine::{EngineConfig, EngineError, FlowEngine};
pub use flow::FlowDefinition;
pub use message::OutboundPayload;
