use std::sync::Arc;

use admission_functions::{
    admission_request::AdmissionRequest, admission_response::AdmissionResponse,
};
use axum::{
    body::Bytes,
    extract,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::{debug, error, warn, Span};

use crate::{
    admission_review::{decode, encode, DecodeError},
    api::{api_error::ApiError, state::ApiServerState},
    dispatch::DispatchError,
};

// note about tracing: the topic is recorded manually, otherwise the automatic
// "export" would quote the string twice.
#[tracing::instrument(
    name = "mutation",
    fields(
        request_uid=tracing::field::Empty,
        host=crate::config::HOSTNAME.as_str(),
        topic=state.topics.mutate.as_str(),
        name=tracing::field::Empty,
        namespace=tracing::field::Empty,
        operation=tracing::field::Empty,
        subresource=tracing::field::Empty,
        kind_group=tracing::field::Empty,
        kind_version=tracing::field::Empty,
        kind=tracing::field::Empty,
        resource_group=tracing::field::Empty,
        resource_version=tracing::field::Empty,
        resource=tracing::field::Empty,
        allowed=tracing::field::Empty,
        mutated=tracing::field::Empty,
        response_code=tracing::field::Empty,
        response_message=tracing::field::Empty,
    ),
    skip_all)]
/// Forward an admission review to the mutating decision function
pub(crate) async fn mutate_handler(
    extract::State(state): extract::State<Arc<ApiServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, ApiError)> {
    let topic = state.topics.mutate.clone();
    review(&state, &topic, &headers, &body).await
}

#[tracing::instrument(
    name = "validation",
    fields(
        request_uid=tracing::field::Empty,
        host=crate::config::HOSTNAME.as_str(),
        topic=state.topics.validate.as_str(),
        name=tracing::field::Empty,
        namespace=tracing::field::Empty,
        operation=tracing::field::Empty,
        subresource=tracing::field::Empty,
        kind_group=tracing::field::Empty,
        kind_version=tracing::field::Empty,
        kind=tracing::field::Empty,
        resource_group=tracing::field::Empty,
        resource_version=tracing::field::Empty,
        resource=tracing::field::Empty,
        allowed=tracing::field::Empty,
        mutated=tracing::field::Empty,
        response_code=tracing::field::Empty,
        response_message=tracing::field::Empty,
    ),
    skip_all)]
/// Forward an admission review to the validating decision function
pub(crate) async fn validate_handler(
    extract::State(state): extract::State<Arc<ApiServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, ApiError)> {
    let topic = state.topics.validate.clone();
    review(&state, &topic, &headers, &body).await
}

pub(crate) async fn readiness_handler() -> StatusCode {
    StatusCode::OK
}

async fn review(
    state: &ApiServerState,
    topic: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<impl IntoResponse, (StatusCode, ApiError)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let admission_review = decode(content_type, body).map_err(handle_decode_error)?;
    debug!(admission_review = %String::from_utf8_lossy(body));

    let request = &admission_review.request;
    populate_span_with_admission_request_data(request);

    let response = state
        .correlator
        .resolve(request, topic)
        .await
        .unwrap_or_else(|e| handle_dispatch_error(&request.uid, e));

    populate_span_with_decision_results(&response);

    let payload = encode(
        response,
        &request.uid,
        admission_review.api_version.as_deref(),
    )
    .map_err(handle_encode_error)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())],
        payload,
    ))
}

fn populate_span_with_admission_request_data(adm_req: &AdmissionRequest) {
    Span::current().record("kind", adm_req.kind.kind.as_str());
    Span::current().record("kind_group", adm_req.kind.group.as_str());
    Span::current().record("kind_version", adm_req.kind.version.as_str());
    Span::current().record("name", adm_req.name.clone().unwrap_or_default().as_str());
    Span::current().record(
        "namespace",
        adm_req.namespace.clone().unwrap_or_default().as_str(),
    );
    Span::current().record("operation", adm_req.operation.to_string().as_str());
    Span::current().record("request_uid", adm_req.uid.as_str());
    Span::current().record("resource", adm_req.resource.resource.as_str());
    Span::current().record("resource_group", adm_req.resource.group.as_str());
    Span::current().record("resource_version", adm_req.resource.version.as_str());
    Span::current().record(
        "subresource",
        adm_req.sub_resource.clone().unwrap_or_default().as_str(),
    );
}

fn populate_span_with_decision_results(response: &AdmissionResponse) {
    Span::current().record("allowed", response.allowed);
    Span::current().record("mutated", response.patch.is_some());
    if let Some(status) = &response.status {
        if let Some(code) = &status.code {
            Span::current().record("response_code", code);
        }
        if let Some(message) = &status.message {
            Span::current().record("response_message", message.as_str());
        }
    }
}

/// Dispatch failures are reported to the API server as a rejection whose status
/// code tells the kind of failure
fn handle_dispatch_error(request_uid: &str, error: DispatchError) -> AdmissionResponse {
    let code = match &error {
        DispatchError::Timeout { .. } => 504,
        DispatchError::AlreadyPending(_) => 409,
        DispatchError::FunctionFailed(_)
        | DispatchError::InvalidReply(_)
        | DispatchError::SerializeRequest(_) => 500,
    };

    match code {
        409 => warn!(error = %error, "duplicate admission request"),
        _ => error!(error = %error, "dispatch error"),
    }

    AdmissionResponse::reject(request_uid.to_owned(), error.to_string(), code)
}

fn handle_decode_error(error: DecodeError) -> (StatusCode, ApiError) {
    warn!(error = %error, "cannot decode admission review");
    let api_error = ApiError::from(error);

    (api_error.status, api_error)
}

fn handle_encode_error(error: serde_json::Error) -> (StatusCode, ApiError) {
    error!("cannot encode admission review: {}", error);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Something went wrong".to_owned(),
        },
    )
}
