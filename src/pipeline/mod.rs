//! The event-driven orchestration fabric (§2): message bus, object store,
//! the five stage workers, and the session coordinator that observes all
//! of them.

pub mod admission;
pub mod bus;
pub mod dto;
pub mod envelope;
pub mod jd_extractor;
pub mod object_store;
pub mod report_generator;
pub mod resume_parser;
pub mod scoring_engine;
pub mod session_coordinator;
pub mod subjects;
pub mod worker;
