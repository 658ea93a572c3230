//! Tally server.
//!
//! Process wiring around the `tally-core` durable execution core: the HTTP
//! submission adapter, the worker pool, the lease reaper, and the supervisor
//! that keeps them running.

pub mod api;
pub mod config;
pub mod migrate;
pub mod reaper;
pub mod serve;
pub mod submit;
pub mod supervisor;
pub mod worker;
