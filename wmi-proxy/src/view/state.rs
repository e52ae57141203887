//! Enumerated property values of `Msvm_ComputerSystem`.

use core::fmt;

/// `EnabledState` of a computer system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    Running,
    Off,
    ShuttingDown,
    NotApplicable,
    Disabled,
    Paused,
    /// Saved to disk.
    Suspended,
    Starting,
    Snapshotting,
    Saving,
    Stopping,
    Pausing,
    Resuming,
}

// (EnabledState, state, label)
const ENABLED_STATES: [(u16, VmState, &str); 13] = [
    (2, VmState::Running, "Running"),
    (3, VmState::Off, "Off"),
    (4, VmState::ShuttingDown, "Shutting Down"),
    (5, VmState::NotApplicable, "Not Applicable"),
    (6, VmState::Disabled, "Disabled"),
    (32768, VmState::Paused, "Paused"),
    (32769, VmState::Suspended, "Saved"),
    (32770, VmState::Starting, "Starting"),
    (32771, VmState::Snapshotting, "Taking Snapshot"),
    (32773, VmState::Saving, "Saving"),
    (32774, VmState::Stopping, "Stopping"),
    (32776, VmState::Pausing, "Pausing"),
    (32777, VmState::Resuming, "Resuming"),
];

impl VmState {
    /// `None` for values outside the known set.
    pub fn from_enabled_state(value: u16) -> Option<Self> {
        ENABLED_STATES
            .iter()
            .find(|(raw, _, _)| *raw == value)
            .map(|(_, state, _)| *state)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = ENABLED_STATES
            .iter()
            .find(|(_, state, _)| state == self)
            .map_or("Unknown", |(_, _, label)| *label);
        f.write_str(label)
    }
}

/// `HealthState` of a computer system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Unknown,
    Ok,
    MajorFailure,
    CriticalFailure,
}

impl HealthState {
    pub fn from_value(value: u16) -> Self {
        match value {
            5 => HealthState::Ok,
            20 => HealthState::MajorFailure,
            25 => HealthState::CriticalFailure,
            _ => HealthState::Unknown,
        }
    }
}

/// Argument of `RequestStateChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestedState {
    Running = 2,
    /// Hard power off.
    Off = 3,
    Reset = 11,
    Paused = 32768,
    Saved = 32769,
}

impl RequestedState {
    pub fn value(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_state_lookup() {
        assert_eq!(VmState::from_enabled_state(2), Some(VmState::Running));
        assert_eq!(VmState::from_enabled_state(32769), Some(VmState::Suspended));
        assert_eq!(VmState::from_enabled_state(1), None);
        assert_eq!(VmState::from_enabled_state(32772), None);
    }

    #[test]
    fn test_vm_state_display() {
        assert_eq!(VmState::Suspended.to_string(), "Saved");
        assert_eq!(VmState::ShuttingDown.to_string(), "Shutting Down");
    }

    #[test]
    fn test_requested_state_values() {
        assert_eq!(RequestedState::Running.value(), 2);
        assert_eq!(RequestedState::Saved.value(), 32769);
        assert_eq!(HealthState::from_value(20), HealthState::MajorFailure);
        assert_eq!(HealthState::from_value(7), HealthState::Unknown);
    }
}
