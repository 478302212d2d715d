use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use tracing::info;

use super::{log_admission_review, DecisionFunction, KindDispatch};
use crate::admission_request::AdmissionRequest;
use crate::admission_response::{
    AdmissionResponse, AdmissionResponseStatus, AdmissionResponseStatusValue,
};
use crate::errors::Result;
use crate::labels::LabelPolicy;

pub const VALIDATING_FUNCTION_NAME: &str = "validate";

const FORBIDDEN: u16 = 403;

/// Kinds subject to the required labels policy
pub const VALIDATED_KINDS: [&str; 5] = ["Pod", "Deployment", "StatefulSet", "DaemonSet", "Service"];

/// Only the metadata is needed to evaluate the label policy, whatever the kind
#[derive(Deserialize, Default)]
struct ObjectWithMetadata {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// Denies workloads and services that lack the required labels
pub struct ValidatingFunction {
    dispatch: KindDispatch,
}

impl ValidatingFunction {
    pub fn new(policy: LabelPolicy) -> Self {
        let dispatch = VALIDATED_KINDS
            .iter()
            .fold(KindDispatch::new(), |dispatch, kind| {
                let policy = policy.clone();
                dispatch.register(kind, move |req: &AdmissionRequest| {
                    validate_labels(req, &policy)
                })
            });

        ValidatingFunction { dispatch }
    }
}

impl Default for ValidatingFunction {
    fn default() -> Self {
        ValidatingFunction::new(LabelPolicy::default())
    }
}

impl DecisionFunction for ValidatingFunction {
    fn name(&self) -> &str {
        VALIDATING_FUNCTION_NAME
    }

    fn decide(&self, request: &AdmissionRequest) -> Result<AdmissionResponse> {
        self.dispatch.dispatch(request)
    }
}

fn validate_labels(request: &AdmissionRequest, policy: &LabelPolicy) -> Result<AdmissionResponse> {
    let Some(object) = request.decode_object::<ObjectWithMetadata>()? else {
        return Ok(AdmissionResponse::allow(request.uid.clone()));
    };
    let metadata = &object.metadata;
    log_admission_review(
        request,
        metadata.name.as_deref(),
        metadata.namespace.as_deref(),
    );

    let decision = policy.evaluate(metadata, request.namespace.as_deref());
    info!(
        request_uid = request.uid.as_str(),
        allowed = decision.allowed,
        "label policy evaluated"
    );

    if decision.allowed {
        return Ok(AdmissionResponse::allow(request.uid.clone()));
    }

    Ok(AdmissionResponse {
        uid: request.uid.clone(),
        allowed: false,
        status: Some(AdmissionResponseStatus {
            status: Some(AdmissionResponseStatusValue::Failure),
            message: decision.reason.clone(),
            reason: decision.reason,
            code: Some(FORBIDDEN),
        }),
        ..Default::default()
    })
}
