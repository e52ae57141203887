use std::any::Any;
use std::collections::HashMap;

use super::base::View;
use super::typed::{ConcreteJobView, ShutdownComponentView, SystemSettingView, VirtualMachineView};
use crate::error::{Error, Result};
use crate::object::fold;

/// A view resolved from the registry, typed or generic.
pub trait ManagementObject: Send + Sync + 'static {
    fn view(&self) -> &View;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A view bound to one WMI class.
pub trait TypedView: Send + Sync + Sized + 'static {
    /// Class the view is registered for.
    const CLASS_NAME: &'static str;

    fn from_view(view: View) -> Self;

    fn base_view(&self) -> &View;
}

impl<T: TypedView> ManagementObject for T {
    fn view(&self) -> &View {
        self.base_view()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Fallback for classes without a registered view.
#[derive(Debug)]
pub struct GenericView {
    view: View,
}

impl TypedView for GenericView {
    const CLASS_NAME: &'static str = "";

    fn from_view(view: View) -> Self {
        Self { view }
    }

    fn base_view(&self) -> &View {
        &self.view
    }
}

type Constructor = fn(View) -> Box<dyn ManagementObject>;

fn construct<T: TypedView>(view: View) -> Box<dyn ManagementObject> {
    Box::new(T::from_view(view))
}

/// Builder for a [`ViewRegistry`].
#[derive(Default)]
pub struct ViewRegistryBuilder {
    entries: Vec<(&'static str, Constructor)>,
}

impl ViewRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TypedView>(mut self) -> Self {
        self.entries.push((T::CLASS_NAME, construct::<T>));
        self
    }

    /// The views shipped with this crate.
    pub fn with_builtin_views(self) -> Self {
        self.register::<VirtualMachineView>()
            .register::<SystemSettingView>()
            .register::<ShutdownComponentView>()
            .register::<ConcreteJobView>()
    }

    /// Fails with `DuplicateRegistration` when a class appears twice.
    pub fn build(self) -> Result<ViewRegistry> {
        let mut constructors = HashMap::with_capacity(self.entries.len());
        for (class_name, constructor) in self.entries {
            if constructors.insert(fold(class_name), constructor).is_some() {
                return Err(Error::DuplicateRegistration(class_name.to_string()));
            }
        }
        tracing::debug!(classes = constructors.len(), "built view registry");
        Ok(ViewRegistry { constructors })
    }
}

/// Maps WMI class names to view constructors.
pub struct ViewRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ViewRegistry {
    pub fn builder() -> ViewRegistryBuilder {
        ViewRegistryBuilder::new()
    }

    /// Wrap `view` in the view type registered for its class, or a
    /// [`GenericView`].
    pub fn create(&self, view: View) -> Box<dyn ManagementObject> {
        match self.constructors.get(&fold(view.class_name())) {
            Some(constructor) => constructor(view),
            None => construct::<GenericView>(view),
        }
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.constructors.contains_key(&fold(class_name))
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let err = ViewRegistry::builder()
            .register::<VirtualMachineView>()
            .register::<VirtualMachineView>()
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
        assert!(err.to_string().contains("Msvm_ComputerSystem"));
    }

    #[test]
    fn test_builtin_views_registered_case_insensitively() {
        let registry = ViewRegistry::builder().with_builtin_views().build().unwrap();
        assert_eq!(registry.len(), 4);
        assert!(registry.is_registered("msvm_computersystem"));
        assert!(registry.is_registered("MSVM_CONCRETEJOB"));
        assert!(!registry.is_registered("Msvm_Memory"));
        assert!(ViewRegistry::default().is_empty());
    }
}
