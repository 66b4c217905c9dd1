//! Event-driven orchestration fabric for the AI-assisted recruitment
//! analysis pipeline: a durable pub/sub bus, content-addressed object
//! store, five stage workers, and the session coordinator that observes
//! them all.

pub mod config;
pub mod db;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod pipeline;
