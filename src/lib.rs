//! Converts kernel performance-counter sampling traces into the Gecko
//! profiler's legacy "profileJSONWithSymbolicationTable" format.
//!
//! A trace is either a binary MiniPerf file or the textual record dump the
//! trace tool prints (optionally produced on the fly by running that tool
//! as a subprocess). The conversion pipeline decodes the event stream,
//! maintains a time-varying address space per process, resolves raw
//! instruction pointers to symbol names, and serializes the per-CPU sample
//! lists together with a frame-label compression table.
//!
//! The [`query`] module is an independent consumer of the emitted profiles:
//! regex filtering, duration accounting, stack inversion, and grouping for
//! offline analysis.

pub mod address_space;
pub mod convert;
pub mod dump;
pub mod event;
pub mod profile;
pub mod query;
pub mod symbols;
pub mod trace_file;
mod utils;
