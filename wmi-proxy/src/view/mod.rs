//! Typed views over proxies, and the registry that picks a view per class.

mod base;
mod registry;
mod state;
mod typed;

pub use base::{PutState, View};
pub use registry::{GenericView, ManagementObject, TypedView, ViewRegistry, ViewRegistryBuilder};
pub use state::{HealthState, RequestedState, VmState};
pub use typed::{ConcreteJobView, ShutdownComponentView, SystemSettingView, VirtualMachineView};
