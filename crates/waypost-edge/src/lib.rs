//! Waypost edge client library.
//!
//! A battery-powered edge node scans the local radio environment for
//! iBeacon advertisements, batches signal-strength samples, and streams
//! them to the ingest server over mutually-authenticated TLS. The server
//! piggy-backs shell commands on its responses; the edge executes them and
//! uplinks the captured output.
//!
//! Two tasks cooperate over a bounded channel: the scanner (producer, see
//! [`scanner`]) and the control loop (consumer, [`EdgeClient`]). The
//! producer blocks when the channel is full; samples are never dropped
//! locally.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod client;
mod error;
mod runner;
pub mod scanner;
pub mod tls;

pub use batch::BatchBuffer;
pub use client::{EdgeClient, EdgeConfig, INITIAL_BACKOFF, MAX_BACKOFF};
pub use error::EdgeError;
pub use runner::{CommandOutput, CommandRunner, RecordingRunner, SubprocessRunner};
pub use scanner::{BeaconRecord, SCAN_CHANNEL_CAP};
