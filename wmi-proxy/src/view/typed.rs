//! Views for the classes this crate knows by name.

use std::sync::Arc;
use std::time::Duration;

use super::base::View;
use super::registry::TypedView;
use super::state::{HealthState, RequestedState, VmState};
use crate::error::{Error, Result};
use crate::object::{KeyValue, PropertyMap};
use crate::task::{JobState, Operation, ShutdownErrorCodeMapper, Task};

/// A virtual machine or the host (`Msvm_ComputerSystem`).
#[derive(Debug)]
pub struct VirtualMachineView {
    view: View,
}

impl TypedView for VirtualMachineView {
    const CLASS_NAME: &'static str = "Msvm_ComputerSystem";

    fn from_view(view: View) -> Self {
        Self { view }
    }

    fn base_view(&self) -> &View {
        &self.view
    }
}

impl VirtualMachineView {
    /// VM identifier (a GUID for virtual machines).
    pub fn name(&self) -> Result<String> {
        self.view.get_property("Name")
    }

    pub fn element_name(&self) -> Result<String> {
        self.view.get_property("ElementName")
    }

    /// Current enabled state; values outside the known set are rejected.
    pub fn state(&self) -> Result<VmState> {
        let raw: u16 = self.view.get_property("EnabledState")?;
        VmState::from_enabled_state(raw).ok_or_else(|| Error::InvalidPropertyValue {
            property: "EnabledState".to_string(),
            expected: "VM state",
            value: raw.to_string(),
        })
    }

    pub fn health_state(&self) -> Result<HealthState> {
        let raw: Option<u16> = self.view.get_property_or("HealthState", None)?;
        Ok(raw.map(HealthState::from_value).unwrap_or(HealthState::Unknown))
    }

    /// Active settings of the VM.
    pub fn settings(&self) -> Result<SystemSettingView> {
        let association = &self.view.server().associations().system_to_system_setting;
        self.view
            .get_related_object::<SystemSettingView>(association, true)?
            .ok_or_else(|| Error::RelatedObjectNotFound {
                path: self.view.key().to_string(),
                association: association.to_string(),
                class_name: SystemSettingView::CLASS_NAME.to_string(),
            })
    }

    pub fn shutdown_component(&self) -> Result<Option<ShutdownComponentView>> {
        let association = &self.view.server().associations().virtual_machine_shutdown_component;
        self.view.get_related_object(association, false)
    }

    pub fn begin_request_state_change(&self, state: RequestedState) -> Result<Task> {
        tracing::info!(vm = %self.view.key(), ?state, "requesting state change");
        let args = PropertyMap::new().with("RequestedState", state.value());
        let result = self.view.invoke_method("RequestStateChange", &args)?;
        let mut task = self.view.begin_method_task_return(&result, None)?;
        let name = self.element_name().unwrap_or_default();
        task.set_client_side_failed_message(format!(
            "Failed to change the state of virtual machine '{name}'."
        ));
        Ok(task)
    }

    pub fn request_state_change(&self, state: RequestedState) -> Result<()> {
        let task = self.begin_request_state_change(state)?;
        self.view.end_method(task, Operation::ChangeState)
    }
}

/// Settings of a virtual machine (`Msvm_VirtualSystemSettingData`).
#[derive(Debug)]
pub struct SystemSettingView {
    view: View,
}

impl TypedView for SystemSettingView {
    const CLASS_NAME: &'static str = "Msvm_VirtualSystemSettingData";

    fn from_view(view: View) -> Self {
        Self { view }
    }

    fn base_view(&self) -> &View {
        &self.view
    }
}

impl SystemSettingView {
    pub fn instance_id(&self) -> Result<String> {
        self.view.get_property("InstanceID")
    }

    pub fn element_name(&self) -> Result<String> {
        self.view.get_property("ElementName")
    }

    pub fn set_element_name(&self, name: &str) {
        self.view.set_property("ElementName", name);
    }

    /// Notes, one entry per line.
    pub fn notes(&self) -> Result<Vec<String>> {
        let notes: Option<Vec<String>> = self.view.get_property_or("Notes", None)?;
        Ok(notes.unwrap_or_default())
    }

    pub fn set_notes(&self, notes: &str) {
        let lines: Vec<String> = notes.lines().map(str::to_string).collect();
        self.view.set_property("Notes", lines);
    }

    pub fn put(&self) -> Result<()> {
        self.view.put()
    }

    /// The VM these settings belong to.
    pub fn system(&self) -> Result<Option<VirtualMachineView>> {
        let association = &self.view.server().associations().system_setting_to_system;
        self.view.get_related_object(association, false)
    }
}

/// Guest shutdown integration component (`Msvm_ShutdownComponent`).
#[derive(Debug)]
pub struct ShutdownComponentView {
    view: View,
}

impl TypedView for ShutdownComponentView {
    const CLASS_NAME: &'static str = "Msvm_ShutdownComponent";

    fn from_view(view: View) -> Self {
        let system = match view.path().key("SystemName") {
            Some(KeyValue::String(name)) => name.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Self {
            view: view.with_mapper(Arc::new(ShutdownErrorCodeMapper::new(system))),
        }
    }

    fn base_view(&self) -> &View {
        &self.view
    }
}

impl ShutdownComponentView {
    pub fn begin_initiate_shutdown(&self, force: bool, reason: &str) -> Result<Task> {
        tracing::info!(component = %self.view.key(), force, "initiating guest shutdown");
        let args = PropertyMap::new().with("Force", force).with("Reason", reason);
        let result = self.view.invoke_method("InitiateShutdown", &args)?;
        self.view.begin_method_task_return(&result, None)
    }

    /// Ask the guest to shut down and wait for the outcome.
    pub fn initiate_shutdown(&self, force: bool, reason: &str) -> Result<()> {
        let task = self.begin_initiate_shutdown(force, reason)?;
        self.view.end_method(task, Operation::Shutdown)
    }
}

/// A server-side job (`Msvm_ConcreteJob`) read as plain properties.
#[derive(Debug)]
pub struct ConcreteJobView {
    view: View,
}

impl TypedView for ConcreteJobView {
    const CLASS_NAME: &'static str = "Msvm_ConcreteJob";

    fn from_view(view: View) -> Self {
        Self { view }
    }

    fn base_view(&self) -> &View {
        &self.view
    }
}

impl ConcreteJobView {
    pub fn instance_id(&self) -> Result<String> {
        self.view.get_property("InstanceID")
    }

    pub fn name(&self) -> Result<String> {
        self.view.get_property_or("ElementName", String::new())
    }

    pub fn job_state(&self) -> Result<JobState> {
        let raw: u16 = self.view.get_property("JobState")?;
        Ok(JobState::from(raw))
    }

    pub fn percent_complete(&self) -> Result<u16> {
        self.view.get_property("PercentComplete")
    }

    pub fn error_code(&self) -> Result<u16> {
        self.view.get_property_or("ErrorCode", 0)
    }

    pub fn error_description(&self) -> Result<Option<String>> {
        self.view.get_property_or("ErrorDescription", None)
    }

    pub fn error_summary_description(&self) -> Result<Option<String>> {
        self.view.get_property_or("ErrorSummaryDescription", None)
    }

    pub fn elapsed_time(&self) -> Result<Duration> {
        self.view.get_property_or("ElapsedTime", Duration::ZERO)
    }

    pub fn cancellable(&self) -> Result<bool> {
        self.view.get_property_or("Cancellable", false)
    }

    /// Follow this job as a task.
    pub fn task(&self) -> Result<Task> {
        self.view.server().task_from_path(self.view.path())
    }
}
