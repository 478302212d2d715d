use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use tracing::info;

use super::{log_admission_review, DecisionFunction, KindDispatch};
use crate::admission_request::AdmissionRequest;
use crate::admission_response::AdmissionResponse;
use crate::errors::Result;
use crate::resources::{compile_resource_defaults, ResourcePolicy};
use crate::volumes::{compile_volume_injection, InjectionConfig};

pub const MUTATING_FUNCTION_NAME: &str = "mutate";

/// Sets default resources on Deployments and injects volumes into Pods.
/// Requests are always allowed, only the patch changes.
pub struct MutatingFunction {
    dispatch: KindDispatch,
}

impl MutatingFunction {
    pub fn new(resource_policy: ResourcePolicy, injection: InjectionConfig) -> Self {
        let dispatch = KindDispatch::new()
            .register("Deployment", move |req: &AdmissionRequest| {
                mutate_deployment(req, &resource_policy)
            })
            .register("Pod", move |req: &AdmissionRequest| {
                mutate_pod(req, &injection)
            });

        MutatingFunction { dispatch }
    }
}

impl Default for MutatingFunction {
    fn default() -> Self {
        MutatingFunction::new(ResourcePolicy::default(), InjectionConfig::default())
    }
}

impl DecisionFunction for MutatingFunction {
    fn name(&self) -> &str {
        MUTATING_FUNCTION_NAME
    }

    fn decide(&self, request: &AdmissionRequest) -> Result<AdmissionResponse> {
        self.dispatch.dispatch(request)
    }
}

fn mutate_deployment(request: &AdmissionRequest, policy: &ResourcePolicy) -> Result<AdmissionResponse> {
    let Some(deployment) = request.decode_object::<Deployment>()? else {
        return Ok(AdmissionResponse::allow(request.uid.clone()));
    };
    log_admission_review(
        request,
        deployment.metadata.name.as_deref(),
        deployment.metadata.namespace.as_deref(),
    );

    let patch = compile_resource_defaults(&deployment, policy);
    info!(
        request_uid = request.uid.as_str(),
        operations = patch.len(),
        "resource defaults computed"
    );

    AdmissionResponse::allow(request.uid.clone()).with_patch(&patch)
}

fn mutate_pod(request: &AdmissionRequest, config: &InjectionConfig) -> Result<AdmissionResponse> {
    let Some(pod) = request.decode_object::<Pod>()? else {
        return Ok(AdmissionResponse::allow(request.uid.clone()));
    };
    log_admission_review(
        request,
        pod.metadata.name.as_deref(),
        pod.metadata.namespace.as_deref(),
    );

    let patch = compile_volume_injection(&pod, config)?;
    info!(
        request_uid = request.uid.as_str(),
        operations = patch.len(),
        "volume injection computed"
    );

    AdmissionResponse::allow(request.uid.clone()).with_patch(&patch)
}
