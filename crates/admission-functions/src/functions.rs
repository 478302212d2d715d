use std::collections::HashMap;

use tracing::{debug, info};

use crate::admission_request::AdmissionRequest;
use crate::admission_response::AdmissionResponse;
use crate::errors::Result;

mod mutating;
mod validating;

pub use mutating::MutatingFunction;
pub use validating::ValidatingFunction;

/// A unit computing the admission verdict of a request.
///
/// Decision functions are invoked over a message bus that may deliver the same request more
/// than once, hence implementations must be pure: the same request always yields the same
/// response and no side effect is performed.
pub trait DecisionFunction: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, request: &AdmissionRequest) -> Result<AdmissionResponse>;
}

/// Computes the response for the requests targeting a single object kind
pub trait KindHandler: Send + Sync {
    fn handle(&self, request: &AdmissionRequest) -> Result<AdmissionResponse>;
}

impl<F> KindHandler for F
where
    F: Fn(&AdmissionRequest) -> Result<AdmissionResponse> + Send + Sync,
{
    fn handle(&self, request: &AdmissionRequest) -> Result<AdmissionResponse> {
        self(request)
    }
}

/// Maps an object kind to the handler that knows how to decode and evaluate it.
/// New kinds are supported by registering a handler, the dispatching logic never changes.
#[derive(Default)]
pub struct KindDispatch {
    handlers: HashMap<String, Box<dyn KindHandler>>,
}

impl KindDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: &str, handler: impl KindHandler + 'static) -> Self {
        self.handlers.insert(kind.to_owned(), Box::new(handler));
        self
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Kinds without a registered handler are allowed without any mutation
    pub fn dispatch(&self, request: &AdmissionRequest) -> Result<AdmissionResponse> {
        match self.handlers.get(&request.kind.kind) {
            Some(handler) => handler.handle(request),
            None => {
                info!(
                    kind = request.kind.kind.as_str(),
                    request_uid = request.uid.as_str(),
                    "no handler registered for kind, allowing request"
                );
                Ok(AdmissionResponse::allow(request.uid.clone()))
            }
        }
    }
}

fn log_admission_review(request: &AdmissionRequest, name: Option<&str>, namespace: Option<&str>) {
    debug!(
        kind = request.kind.kind.as_str(),
        namespace = namespace.or(request.namespace.as_deref()).unwrap_or_default(),
        name = name.or(request.name.as_deref()).unwrap_or_default(),
        request_uid = request.uid.as_str(),
        operation = %request.operation,
        username = request.user_info.username.as_deref().unwrap_or_default(),
        "admission review"
    );
}
