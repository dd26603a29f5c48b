// Module-side object model plus the client-side typed handle.
pub mod iid;
pub mod object;
pub mod registry;
pub mod smart;

pub use iid::{IID_OBJECT, InterfaceId};
pub use object::{Component, ComponentObject, InterfaceEntry, component_from_interface};
pub use registry::{ComponentRegistry, CreatorFn, ObjectEntry};
pub use smart::{CafObject, Interface, SmartRef};
