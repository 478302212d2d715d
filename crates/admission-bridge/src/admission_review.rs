use admission_functions::admission_request::AdmissionRequest;
use admission_functions::admission_response::AdmissionResponse;
use thiserror::Error;

pub const ADMISSION_REVIEW_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported media type {0:?}, expected application/json")]
    UnsupportedMediaType(String),
    #[error("malformed admission review: {0}")]
    MalformedBody(String),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub request: AdmissionRequest,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub response: AdmissionResponse,
}

impl AdmissionReviewResponse {
    pub fn new(response: AdmissionResponse, api_version: Option<&str>) -> Self {
        AdmissionReviewResponse {
            api_version: Some(
                api_version
                    .filter(|v| !v.is_empty())
                    .unwrap_or(ADMISSION_REVIEW_API_VERSION)
                    .to_owned(),
            ),
            kind: Some(ADMISSION_REVIEW_KIND.to_owned()),
            response,
        }
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .parse::<mime::Mime>()
        .map(|m| m.type_() == mime::APPLICATION && m.subtype() == mime::JSON)
        .unwrap_or(false)
}

/// Decode the body of an admission webhook call
pub fn decode(content_type: Option<&str>, body: &[u8]) -> Result<AdmissionReviewRequest, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::MalformedBody("empty body".to_owned()));
    }

    let content_type = content_type.unwrap_or_default();
    if !is_json(content_type) {
        return Err(DecodeError::UnsupportedMediaType(content_type.to_owned()));
    }

    let review: AdmissionReviewRequest =
        serde_json::from_slice(body).map_err(|e| DecodeError::MalformedBody(e.to_string()))?;
    // replies are correlated by uid, a request without one could never be answered
    if review.request.uid.is_empty() {
        return Err(DecodeError::MalformedBody("request uid is empty".to_owned()));
    }

    Ok(review)
}

/// Wrap the response into an admission review. The response always carries the UID
/// of the request that originated it.
pub fn encode(
    mut response: AdmissionResponse,
    request_uid: &str,
    api_version: Option<&str>,
) -> serde_json::Result<Vec<u8>> {
    response.uid = request_uid.to_owned();
    serde_json::to_vec(&AdmissionReviewResponse::new(response, api_version))
}
