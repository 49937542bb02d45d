#![forbid(unsafe_code)]

//! # playtrack
//!
//! Client-side tracking for jobs executed by a remote Ansible runner.
//! Encapsulates abstractions for things like:
//!
//! - Submitting playbooks, with pre-submit hooks that inject agent and
//!   baseline configuration into the job's extra vars
//! - Polling job status with adaptive backoff
//! - Parsing raw `ansible-playbook` output into tasks, per-host outcomes and
//!   recap counters
//! - Correlating single-host jobs back to the multi-host job they belong to
//! - Rendering parsed output into a display model

pub mod baseline;
pub mod correlate;
pub mod error;
pub mod hooks;
pub mod hosts;
#[doc(hidden)]
pub mod ipc;
pub mod job;
pub mod log;
pub mod parse;
pub mod poll;
pub mod render;
pub mod store;
pub mod tracker;
