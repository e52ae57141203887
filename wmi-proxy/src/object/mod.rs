//! Remote object identity and property values.

mod instance;
mod key;
mod path;
mod value;

pub use instance::{CimInstance, PropertyMap};
pub use key::ObjectKey;
pub use path::{KeyValue, WmiObjectPath};
pub use value::{format_cim_interval, parse_cim_interval, CimValue, FromCimValue};

/// Case folding used for class, namespace and property names.
pub(crate) fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}
