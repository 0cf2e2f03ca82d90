//! A caching stub resolver.
//!
//! [`Resolver`] sends queries to the configured nameservers in order, with
//! per-attempt timeouts bounded by an overall lifetime, and stores answers
//! in an optional shared cache ([`Cache`] for pure TTL expiry, [`LruCache`]
//! for a bounded one). [`Resolver::zone_for_name`] finds the apex of the
//! zone that holds a name.

pub mod answer;
pub mod cache;
pub mod config;
pub mod error;
pub mod proto_utils;
pub mod resolver;
pub mod selector;
pub mod transport;
pub mod watcher;
mod zone;

#[cfg(test)]
mod testing;

pub use answer::Answer;
pub use cache::{Cache, CacheStats, Expiring, LruCache, RecordKey, ResolverCache};
pub use config::{ResolverConfig, ResolverSettings};
pub use error::{ResolveError, Result};
pub use resolver::{ResolveOptions, Resolver, ResolverOpts, RetryPolicy, ServerStatsSnapshot};
pub use selector::{ReactorSelector, Selector, SelectorKind, Watched};
