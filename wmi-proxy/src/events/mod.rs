//! Instance event subscriptions shared across proxies.

mod manager;
mod monitor;

pub use manager::{EventMonitorKey, InstanceEventManager};
pub use monitor::{EventHandler, HandlerId, InstanceEventBulkMonitor};
