//! # Query Mirror Library
//!
//! A mirror sits in front of a real game server and answers discovery
//! queries (A2S_INFO) on its behalf from a periodically refreshed snapshot.
//! Optionally it registers itself with the master server directory and
//! restricts who gets an answer based on where the requester is located.
//!
//! ## Architecture Design
//!
//! ### One Loop Per Mirror
//! Every configured mirror runs as its own tokio task with a single,
//! sequential loop that:
//! - handles at most one inbound datagram per iteration
//! - refreshes the snapshot once its TTL (10 s) has elapsed
//! - sends a directory heartbeat every 4 minutes when enabled
//!
//! The loop never blocks on receive for longer than a short poll interval, so
//! timers are serviced promptly with or without traffic. Since nothing inside
//! a mirror is shared with another task, no locks are involved. Mirrors only
//! share the read-only access policy, geolocation lookup and error log.
//!
//! ### Failure Isolation
//! A mirror whose configuration is invalid or whose socket cannot be bound is
//! reported and skipped. A target server that stops answering turns the
//! decoded snapshot into an "unavailable" placeholder until it comes back.
//!
//! ## Module Organization
//!
//! - [`config`]: `Servers.json` / `Settings.json` loading and validation
//! - [`cache`]: the snapshot cache and the upstream A2S_INFO query
//! - [`geo`]: geolocation lookup and the access decision
//! - [`geo_update`]: startup download of the geolocation database
//! - [`heartbeat`]: directory heartbeats and directory query replies
//! - [`network`]: the per-mirror socket and poll loop
//! - [`mirror_set`]: starting all configured mirrors
//! - [`error_log`]: append-only error file
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mirror::config::{AccessPolicy, ServerEntry};
//! use mirror::error_log::ErrorLog;
//! use mirror::geo::UnavailableLookup;
//! use mirror::mirror_set::{MirrorContext, MirrorSet};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let entries = vec![ServerEntry {
//!         target_ip: "10.0.0.5".to_string(),
//!         target_port: Some(27015),
//!         bind_ip: "10.0.0.6".to_string(),
//!         bind_port: Some(27015),
//!         show_master: false,
//!     }];
//!
//!     let context = MirrorContext::new(
//!         AccessPolicy::default(),
//!         Arc::new(UnavailableLookup::new("no database")),
//!         ErrorLog::disabled(),
//!     );
//!
//!     let set = MirrorSet::start(&entries, &context).await;
//!     tokio::signal::ctrl_c().await?;
//!     set.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod error_log;
pub mod geo;
pub mod geo_update;
pub mod heartbeat;
pub mod mirror_set;
pub mod network;
