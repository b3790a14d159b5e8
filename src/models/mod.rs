//! Domain model module declarations.

pub mod endpoint;
pub mod value;

pub use endpoint::EndpointName;
pub use value::{Message, Value};
