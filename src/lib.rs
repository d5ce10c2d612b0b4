//! Flare Resolver Library
//!
//! Client-side service resolution core: watches a service registry, debounces change
//! notifications, filters raw records by namespace and protocol, and fans immutable,
//! revisioned endpoint snapshots out to load balancers without ever blocking on them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flare_resolver::{MemorySource, RawRecord, Resolver, ResolverConfig, State};
//!
//! # async fn run() -> flare_resolver::Result<()> {
//! let source = MemorySource::new();
//! source
//!     .register(RawRecord::new("user", "default", "grpc", "10.0.0.1", 9000))
//!     .await;
//!
//! let resolver = Resolver::new(
//!     "default",
//!     Arc::new(source.clone()),
//!     ResolverConfig::new("default", ["grpc"]),
//! );
//! resolver
//!     .add_watch("user", Arc::new(|state: Arc<State>| {
//!         tracing::info!(revision = state.revision(), "endpoints updated");
//!     }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod retry;

// Re-exports
pub use config::Config;
pub use error::{ErrorCode, ErrorHook, ErrorKind, ResolverError, Result, SourceError};
pub use metrics::MetricsSnapshot;
pub use retry::ExponentialBackoff;

pub use discovery::{
    Attributes, BackendType, ChangeSignal, ChangeSource, ChannelWatcher, Debouncer, Endpoint,
    EndpointDiscover, FanoutReport, FilterPolicy, MemorySource, RawRecord, Resolver,
    ResolverConfig, ResolverFactory, SnapshotBuilder, SourceConfig, SourceFactory, State,
    StaticSource, Subscription, Trigger, WatchState, Watcher, WatcherRegistry, state_channel,
};
#[cfg(feature = "consul")]
pub use discovery::ConsulSource;
#[cfg(feature = "etcd")]
pub use discovery::EtcdSource;
