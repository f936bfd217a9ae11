//! Nimbus Server
//!
//! This crate implements the nimbus daemon: the request server, the command
//! dispatcher, the refresh scheduler, and the file-backed shared cache.
//!
//! # Architecture
//!
//! The daemon runs three kinds of workers on the tokio runtime:
//!
//! - The **request server** accepts localhost TCP connections, one request
//!   per connection, acks each request as soon as its line arrives, and
//!   answers with a result once the command finishes. Command handlers run
//!   on the blocking pool so a provider call that takes tens of seconds
//!   never stalls the accept loop or other in-flight requests.
//! - The **refresh scheduler** wakes on a fixed tick and re-queries stale
//!   record categories (instances, interfaces, subnets, region long names)
//!   from the resource provider, each on its own staleness interval.
//! - The **shared cache** is the single point both of them mutate. It is
//!   mirrored to a JSON snapshot on disk, guarded by file locks so the
//!   long-running daemon and short-lived tooling never observe a torn write.
//!
//! The cloud side is abstracted behind [`provider::ResourceProvider`]; the
//! daemon itself never names a concrete cloud API.

pub mod cache;
pub mod dispatcher;
pub mod pidlock;
pub mod provider;
pub mod scheduler;
pub mod server;

pub use cache::{CacheData, RegionRecord, SharedCache};
pub use dispatcher::Dispatcher;
pub use pidlock::PidLock;
pub use provider::{NullProvider, RecordMap, ResourceProvider};
pub use scheduler::{RefreshCategory, RefreshScheduler, SchedulerConfig};
pub use server::{RequestServer, DEFAULT_PORT};
