//! # swrkit
//!
//! A client-side stale-while-revalidate resource cache for Tokio.
//!
//! Many consumers bind to the same key; one network call serves them all.
//! Cached data is served immediately while a background refresh runs, kept
//! when a refresh fails, and never overwritten by a response that a newer
//! request has superseded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swrkit::{BearerCredentials, Cache, CacheConfig, HttpFetcher, ResourceOptions, TransportAdapter};
//!
//! #[derive(Debug, Clone, serde::Deserialize)]
//! struct Project {
//!     id: u64,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TransportAdapter::new(HttpFetcher::new())
//!         .base_url("http://127.0.0.1:8080")
//!         .credentials(BearerCredentials::new("t0ken"));
//!     let cache: Cache<Project> = Cache::new(transport, CacheConfig::default());
//!
//!     let mut project = cache.use_resource("/projects/42", ResourceOptions::new())?;
//!     let state = project.changed().await;
//!     println!("{:?}", state.data);
//!     Ok(())
//! }
//! ```

// ── Wire primitives and transport ─────────────────────────────────────────────
pub mod http;
pub mod transport;

// ── Cache engine ──────────────────────────────────────────────────────────────
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod key;
pub mod pagination;
pub mod registry;
pub mod scheduler;
pub mod store;

// ── Consumer surface ──────────────────────────────────────────────────────────
pub mod resource;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::CacheConfig;
pub use coordinator::{FetchMode, Flight, Pending};
pub use entry::{CacheEntry, Generation, Settled, Status};
pub use error::{ConfigurationError, FetchError};
pub use key::ResourceKey;
pub use pagination::{Identified, Page};
pub use resource::{PagedResource, Resource, ResourceOptions, ResourceState};
pub use scheduler::{Policy, Trigger};
pub use store::{Cache, CacheValue, Subscription};
pub use transport::{BearerCredentials, Credentials, Fetch, HttpFetcher, TransportAdapter};
