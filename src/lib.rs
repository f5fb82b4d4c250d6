//! # mediactl
//!
//! Session-resilient JSON-RPC-over-WebSocket client for driving a remote
//! media-processing server: create remote objects, invoke operations on
//! them, and subscribe to the events they emit — across connection drops.
//!
//! - **Resilience**: the connection is owned by a background actor that
//!   reconnects with linear backoff (500 ms steps, capped at 10 s) and
//!   resumes the server-side session, so created objects and server state
//!   survive transport failures. In-flight calls are failed, never retried.
//! - **Liveness**: application-level heartbeats detect connections that are
//!   open but dead and force a reconnect.
//! - **Events**: `subscribe` hands back a channel of event payloads for one
//!   `(object, event type)` pair.
//!
//! ```no_run
//! use mediactl::ClientBuilder;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), mediactl::ClientError> {
//! let client = ClientBuilder::new("ws://localhost:8888/control")
//!     .reporter(|line| eprintln!("{line}"))
//!     .connect()
//!     .await?;
//!
//! let pipeline = client.create("MediaPipeline", json!({})).await?;
//! let mut errors = client
//!     .subscribe(pipeline.as_str().unwrap(), "Error")
//!     .await?;
//! while let Some(event) = errors.events.recv().await {
//!     eprintln!("pipeline error: {event}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod client;
mod connection;
mod heartbeat;
mod registry;
mod router;

pub mod error;
pub mod protocol;

pub use client::{ClientBuilder, DEFAULT_HEARTBEAT_GRACE, DEFAULT_HEARTBEAT_INTERVAL, MediaClient};
pub use error::ClientError;
pub use router::Subscription;
