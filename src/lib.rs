//! inspection-sync: offline-first sync engine for field inspection audits
//!
//! Inspectors edit audit results and capture photo evidence on a device with
//! intermittent connectivity. Every edit lands in a local SQLite mirror first
//! and is queued as a durable mutation; the sync engine replays the queue
//! against the remote system of record when the device is online.
//!
//! - [`storage`]: durable local mirror, evidence blobs and the mutation queue
//! - [`sync`]: queue semantics, retry policy and the dispatch engine
//! - [`hydration`]: pulls a project's remote state into the mirror
//! - [`evidence`]: photo capture and upload path
//! - [`service`]: the facade the UI talks to
//! - [`api`]: loopback HTTP control surface over the service

pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod evidence;
pub mod hydration;
pub mod model;
pub mod remote;
pub mod service;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{CaptureError, FailureClass, HydrationError, QueueError, RemoteError, StoreError};
pub use service::{ResultChange, SyncService};
pub use storage::LocalStore;
pub use sync::{EnqueueOutcome, SyncReport};
