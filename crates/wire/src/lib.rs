pub mod attributes;
pub mod error_trace;
pub mod maker;

pub use attributes::{AttributeFlattener, DefaultFlattener};
pub use error_trace::{ErrorTraceAttributes, ErrorTracePayload, ErrorTraceWireModel};
pub use maker::ErrorTraceMaker;
