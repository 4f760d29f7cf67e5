//! Real-time synchronization core for a feature flag SDK.
//!
//! # Overview
//!
//! The crate keeps a local cache of feature flag rules and per-subscriber segment memberships in
//! sync with a remote control plane. The [`SyncOrchestrator`] owns the lifecycle: it performs a
//! full sync on start, then keeps the cache fresh through a streaming connection whenever push
//! delivery is healthy, and falls back to periodic polling whenever it is not.
//!
//! Streaming is handled by the [`ConnectionManager`], which authenticates, connects, survives
//! disconnects and token expiry, and reports push health derived from channel occupancy. Decoded
//! notifications are routed by the [`NotificationRouter`] to one worker for rules and one worker
//! per subscriber key, so that changes to one destination are always applied in order.
//!
//! Most applications only need [`ClientConfig`]:
//!
//! ```no_run
//! # use flagsync::ClientConfig;
//! let sync = ClientConfig::from_api_key("sdk-key")
//!     .listener(|event| println!("{:?}", event))
//!     .to_synchronizer()?;
//! sync.add_subscriber("user-1");
//! sync.start();
//! sync.wait_for_initial_sync()?;
//! # Ok::<(), flagsync::Error>(())
//! ```
//!
//! Every collaborator the core talks to ([`Cache`], [`Fetcher`], [`Authenticator`],
//! [`StreamingTransport`], [`TelemetrySink`], [`Scheduler`]) is a trait, with an HTTP or in-memory
//! implementation provided.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Failures below the orchestrator are never returned to the host. Authentication, transport and
//! protocol errors are classified as recoverable or not and turned into a switch between
//! streaming and polling, reported through [`SyncListener`]. The only error surfaced directly is
//! the outcome of the first sync, through [`SyncOrchestrator::wait_for_initial_sync`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `flagsync` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into streaming operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod auth;
pub mod backoff;
pub mod codec;
mod config;
pub mod connection;
mod error;
pub mod events;
pub mod fetcher;
pub mod hashing;
pub mod occupancy;
pub mod poller;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod synchronizer;
pub mod telemetry;
pub mod token;
pub mod transport;

pub use auth::{AuthResult, Authenticator};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{AuthError, Error, Result, TransportError};
pub use events::{CacheDomain, SyncEvent, SyncListener, SyncMode};
pub use fetcher::Fetcher;
pub use router::NotificationRouter;
pub use scheduler::Scheduler;
pub use storage::Cache;
pub use synchronizer::{SyncOrchestrator, SyncSettings};
pub use telemetry::TelemetrySink;
pub use transport::StreamingTransport;
