//! Navigable relationships between remote classes.

use core::fmt;

use crate::object::WmiObjectPath;

/// How related objects are located.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// `ASSOCIATORS OF` traversal through an association class.
    Associators {
        association_class: String,
        result_class: Option<String>,
        source_role: Option<String>,
        result_role: Option<String>,
    },
    /// Every instance of a class on the same connection.
    Instances { class_name: String },
}

/// Immutable description of a relationship, used as a cache key during traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association {
    kind: AssociationKind,
    do_not_update: bool,
}

impl Association {
    pub fn new(association_class: &str) -> Self {
        Self {
            kind: AssociationKind::Associators {
                association_class: association_class.to_string(),
                result_class: None,
                source_role: None,
                result_role: None,
            },
            do_not_update: false,
        }
    }

    /// Association constrained to a result class and, optionally, the result role.
    pub fn to_class(association_class: &str, result_class: &str, result_role: Option<&str>) -> Self {
        Self::new(association_class)
            .with_result_class(result_class)
            .with_roles(None, result_role)
    }

    /// All instances of `class_name`.
    pub fn instances_of(class_name: &str) -> Self {
        Self {
            kind: AssociationKind::Instances {
                class_name: class_name.to_string(),
            },
            do_not_update: false,
        }
    }

    pub fn with_result_class(mut self, class: &str) -> Self {
        if let AssociationKind::Associators { result_class, .. } = &mut self.kind {
            *result_class = Some(class.to_string());
        }
        self
    }

    pub fn with_roles(mut self, source: Option<&str>, result: Option<&str>) -> Self {
        if let AssociationKind::Associators {
            source_role,
            result_role,
            ..
        } = &mut self.kind
        {
            *source_role = source.map(str::to_string);
            *result_role = result.map(str::to_string);
        }
        self
    }

    /// Exclude this association from bulk association-cache refreshes.
    pub fn do_not_update(mut self) -> Self {
        self.do_not_update = true;
        self
    }

    pub fn kind(&self) -> &AssociationKind {
        &self.kind
    }

    pub fn skips_bulk_update(&self) -> bool {
        self.do_not_update
    }

    /// Class name of the expected results, when known.
    pub fn result_class(&self) -> Option<&str> {
        match &self.kind {
            AssociationKind::Associators { result_class, .. } => result_class.as_deref(),
            AssociationKind::Instances { class_name } => Some(class_name),
        }
    }

    /// WQL text equivalent to this traversal from `source`.
    pub fn to_wql(&self, source: &WmiObjectPath) -> String {
        match &self.kind {
            AssociationKind::Associators {
                association_class,
                result_class,
                source_role,
                result_role,
            } => {
                let mut q = format!(
                    "ASSOCIATORS OF {{{}}} WHERE AssocClass = {}",
                    source.relative_path(),
                    association_class
                );
                if let Some(c) = result_class {
                    q.push_str(&format!(" ResultClass = {c}"));
                }
                if let Some(r) = source_role {
                    q.push_str(&format!(" Role = {r}"));
                }
                if let Some(r) = result_role {
                    q.push_str(&format!(" ResultRole = {r}"));
                }
                q
            }
            AssociationKind::Instances { class_name } => format!("SELECT * FROM {class_name}"),
        }
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AssociationKind::Associators {
                association_class,
                result_class,
                ..
            } => match result_class {
                Some(rc) => write!(f, "{association_class} -> {rc}"),
                None => f.write_str(association_class),
            },
            AssociationKind::Instances { class_name } => write!(f, "instances of {class_name}"),
        }
    }
}

/// Well-known virtualization associations, resolved once per connection.
#[derive(Debug, Clone)]
pub struct Associations {
    pub element_setting_data: Association,
    pub system_to_system_setting: Association,
    pub system_setting_to_system: Association,
    pub system_setting_components: Association,
    pub system_to_snapshot_setting: Association,
    pub system_to_summary: Association,
    pub virtual_machine_processor: Association,
    pub virtual_machine_memory: Association,
    pub virtual_machine_shutdown_component: Association,
    pub virtual_machine_heartbeat_component: Association,
    pub devices_system: Association,
    pub affected_job_element: Association,
    pub virtual_machine_to_migration_job: Association,
    pub query_tasks: Association,
    pub query_virtual_machines: Association,
}

impl Associations {
    pub fn new() -> Self {
        Self {
            element_setting_data: Association::new("Msvm_ElementSettingData"),
            system_to_system_setting: Association::to_class(
                "Msvm_SettingsDefineState",
                "Msvm_VirtualSystemSettingData",
                None,
            ),
            system_setting_to_system: Association::to_class(
                "Msvm_SettingsDefineState",
                "CIM_ComputerSystem",
                None,
            ),
            system_setting_components: Association::new("Msvm_VirtualSystemSettingDataComponent"),
            system_to_snapshot_setting: Association::to_class(
                "Msvm_SnapshotOfVirtualSystem",
                "Msvm_VirtualSystemSettingData",
                None,
            ),
            system_to_summary: Association::to_class(
                "Msvm_ComputerSystemSummaryInformation",
                "Msvm_SummaryInformation",
                None,
            )
            .do_not_update(),
            virtual_machine_processor: Association::to_class(
                "Msvm_SystemDevice",
                "Msvm_Processor",
                None,
            ),
            virtual_machine_memory: Association::to_class("Msvm_SystemDevice", "Msvm_Memory", None),
            virtual_machine_shutdown_component: Association::to_class(
                "Msvm_SystemDevice",
                "Msvm_ShutdownComponent",
                None,
            ),
            virtual_machine_heartbeat_component: Association::to_class(
                "Msvm_SystemDevice",
                "Msvm_HeartbeatComponent",
                None,
            ),
            devices_system: Association::to_class("Msvm_SystemDevice", "CIM_ComputerSystem", None),
            affected_job_element: Association::new("Msvm_AffectedJobElement")
                .with_roles(Some("AffectingElement"), Some("AffectedElement")),
            virtual_machine_to_migration_job: Association::to_class(
                "Msvm_AffectedJobElement",
                "Msvm_MigrationJob",
                Some("AffectingElement"),
            ),
            query_tasks: Association::instances_of("CIM_ConcreteJob").do_not_update(),
            query_virtual_machines: Association::instances_of("Msvm_ComputerSystem"),
        }
    }
}

impl Default for Associations {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wql_rendering() {
        let source = WmiObjectPath::new("HOST1", r"root\virtualization\v2", "Msvm_ComputerSystem")
            .with_key("Name", "ABC");
        let assoc = Association::new("Msvm_SettingsDefineState")
            .with_result_class("Msvm_VirtualSystemSettingData")
            .with_roles(Some("ManagedElement"), Some("SettingData"));
        assert_eq!(
            assoc.to_wql(&source),
            "ASSOCIATORS OF {Msvm_ComputerSystem.Name=\"ABC\"} WHERE AssocClass = Msvm_SettingsDefineState \
             ResultClass = Msvm_VirtualSystemSettingData Role = ManagedElement ResultRole = SettingData"
        );
        assert_eq!(
            Association::instances_of("CIM_ConcreteJob").to_wql(&source),
            "SELECT * FROM CIM_ConcreteJob"
        );
    }

    #[test]
    fn test_do_not_update_flag() {
        let a = Associations::new();
        assert!(a.system_to_summary.skips_bulk_update());
        assert!(!a.system_to_system_setting.skips_bulk_update());
        assert_eq!(
            a.virtual_machine_memory.result_class(),
            Some("Msvm_Memory")
        );
    }

    #[test]
    fn test_associations_are_hashable_cache_keys() {
        use std::collections::HashMap;
        let a = Associations::new();
        let mut cache = HashMap::new();
        cache.insert(a.virtual_machine_memory.clone(), 1);
        cache.insert(a.virtual_machine_processor.clone(), 2);
        assert_eq!(cache.get(&Associations::new().virtual_machine_memory), Some(&1));
    }

    #[test]
    fn test_display() {
        let a = Associations::new();
        assert_eq!(
            a.virtual_machine_memory.to_string(),
            "Msvm_SystemDevice -> Msvm_Memory"
        );
    }
}
