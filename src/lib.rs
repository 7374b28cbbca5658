//! Reader for LTT/LTTng trace directories.
//!
//! A trace is a directory of per-CPU tracefiles. Each tracefile is a series
//! of fixed size subbuffers holding event records. The metadata channel
//! describes every marker (event type) and the fields of its payload. This
//! crate opens such directories, decodes the records into [`Event`] views
//! and merges the tracefiles of one or more traces into a time ordered
//! stream.

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod markers;
pub mod parsers;
pub mod print;
pub mod subbuffer;
#[cfg(test)]
pub(crate) mod testutil;
pub mod time;
pub mod trace;
pub mod tracefile;
pub mod traceset;
pub mod types;

pub use config::TraceOptions;
pub use decoder::Value;
pub use error::DecodeError;
pub use error::TracefileError;
pub use event::Event;
pub use event::EventPosition;
pub use time::LttTime;
pub use trace::SystemDescription;
pub use trace::Trace;
pub use trace::TraceError;
pub use tracefile::Tracefile;
pub use traceset::Traceset;
