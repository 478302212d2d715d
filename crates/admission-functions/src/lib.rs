pub mod admission_request;
pub mod admission_response;
pub mod errors;
pub mod functions;
pub mod labels;
pub mod resources;
mod settings;
pub mod volumes;

pub use functions::{DecisionFunction, KindDispatch, MutatingFunction, ValidatingFunction};
