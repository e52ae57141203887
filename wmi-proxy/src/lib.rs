//! Identity-preserving proxy cache over WMI/CIM management objects
//!
//! Provides:
//! - One live [`Proxy`] per remote object, with lazily fetched properties and associations
//! - Typed views with staged writes, and a registry mapping classes to views
//! - Tasks over synchronous method results and remote jobs
//! - A single event subscription per class fanned out to many handlers
//!
//! A [`Server`] is the entry point. It owns the cache for one connection and
//! talks to the remote side through an [`InstanceStore`].

pub mod association;
pub mod config;
pub mod error;
pub mod events;
pub mod object;
pub mod proxy;
pub mod server;
pub mod store;
pub mod task;
pub mod view;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use association::{Association, Associations};
pub use config::Config;
pub use error::{Error, ErrorKind, FailureReason, FailureType, OperationFailedError, Result};
pub use object::{CimInstance, CimValue, ObjectKey, PropertyMap, WmiObjectPath};
pub use proxy::{Proxy, ProxyFactory, ProxyRepository};
pub use server::Server;
pub use store::{InstanceStore, MemoryStore};
pub use task::{CompletedTask, JobTask, Task, TaskStatus};
pub use view::{ManagementObject, TypedView, View, ViewRegistry};

/// Initialize tracing/logging with the given filter level
pub fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
