use core::fmt;

use super::{CimInstance, KeyValue, WmiObjectPath};
use crate::error::{Error, Result};

/// Cache identity of a remote object.
///
/// Two keys are equal when their paths are equal; see [`WmiObjectPath`] for
/// the comparison rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    path: WmiObjectPath,
}

impl ObjectKey {
    /// Wrap a fully qualified path.
    pub fn new(path: WmiObjectPath) -> Result<Self> {
        if path.server().is_empty() || path.namespace().is_empty() {
            return Err(Error::invalid_key(
                path.class_name(),
                format!("path '{path}' is missing a server or namespace"),
            ));
        }
        Ok(Self { path })
    }

    /// Key addressing a whole class, used for class-wide event registration.
    pub fn for_class(server: &str, namespace: &str, class_name: &str) -> Self {
        Self {
            path: WmiObjectPath::new(server, namespace, class_name),
        }
    }

    /// Build a key from an instance's key-qualified properties.
    pub fn from_instance(server: &str, namespace: &str, instance: &CimInstance) -> Result<Self> {
        if instance.key_names().is_empty() {
            return Err(Error::invalid_key(
                instance.class_name(),
                "instance exposes no key properties",
            ));
        }
        Self::from_instance_with_keys(
            server,
            namespace,
            instance,
            instance.key_names().iter().map(String::as_str),
        )
    }

    /// Build a key from the named properties of an instance.
    ///
    /// Every named property must be present and of a key-compatible type.
    pub fn from_instance_with_keys<'a>(
        server: &str,
        namespace: &str,
        instance: &CimInstance,
        key_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let mut path = WmiObjectPath::new(server, namespace, instance.class_name());
        for name in key_names {
            let value = match instance.property(name) {
                None => None,
                Some(v) if v.is_null() => None,
                Some(v) => Some(v),
            }
            .ok_or_else(|| {
                Error::invalid_key(
                    instance.class_name(),
                    format!("required key property '{name}' is missing"),
                )
            })?;
            let key = KeyValue::from_cim(value).ok_or_else(|| {
                Error::invalid_key(
                    instance.class_name(),
                    format!(
                        "key property '{name}' has unsupported type {}",
                        value.type_name()
                    ),
                )
            })?;
            path = path.with_key(name, key);
        }
        Self::new(path)
    }

    pub fn path(&self) -> &WmiObjectPath {
        &self.path
    }

    pub fn into_path(self) -> WmiObjectPath {
        self.path
    }

    pub fn server(&self) -> &str {
        self.path.server()
    }

    pub fn namespace(&self) -> &str {
        self.path.namespace()
    }

    pub fn class_name(&self) -> &str {
        self.path.class_name()
    }

    pub fn is_class_key(&self) -> bool {
        self.path.is_class_path()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}
