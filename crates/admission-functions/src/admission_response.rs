use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use json_patch::Patch;
use serde::{Deserialize, Serialize};

use crate::errors::{FunctionError, Result};

/// Decision returned to the API server inside an `AdmissionReview`
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Same value as the `uid` of the request being answered
    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub allowed: bool,

    /// Set only when `patch` is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,

    /// RFC 6902 document, base64 encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,

    /// Ignored by the API server when `allowed` is true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionResponseStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_annotations: Option<HashMap<String, String>>,

    /// Shown to the client that issued the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    #[default]
    JSONPatch,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub enum AdmissionResponseStatusValue {
    Success,
    Failure,
}

/// The `metav1.Status` attached to a response
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct AdmissionResponseStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionResponseStatusValue>,

    /// Text reported back to the user by kubectl
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// HTTP-like code, 403 for policy denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl AdmissionResponse {
    pub fn allow(uid: String) -> AdmissionResponse {
        AdmissionResponse {
            uid,
            allowed: true,
            ..Default::default()
        }
    }

    /// A denial with a `Failure` status
    pub fn reject(uid: String, message: String, code: u16) -> AdmissionResponse {
        let status = AdmissionResponseStatus {
            status: Some(AdmissionResponseStatusValue::Failure),
            message: Some(message),
            code: Some(code),
            reason: None,
        };

        AdmissionResponse {
            uid,
            status: Some(status),
            ..Default::default()
        }
    }

    /// Attach a JSON Patch to the response. An empty patch leaves the response untouched.
    pub fn with_patch(self, patch: &Patch) -> Result<AdmissionResponse> {
        if patch.is_empty() {
            return Ok(self);
        }

        let encoded = serde_json::to_vec(patch)
            .map(|bytes| general_purpose::STANDARD.encode(bytes))
            .map_err(FunctionError::SerializePatch)?;

        Ok(AdmissionResponse {
            patch_type: Some(PatchType::JSONPatch),
            patch: Some(encoded),
            status: Some(AdmissionResponseStatus {
                status: Some(AdmissionResponseStatusValue::Success),
                code: Some(200),
                ..Default::default()
            }),
            ..self
        })
    }

    /// Decode the base64 patch carried by the response
    pub fn patch_operations(&self) -> Result<Option<Patch>> {
        let Some(encoded) = &self.patch else {
            return Ok(None);
        };

        let raw = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| FunctionError::DecodePatch(e.to_string()))?;
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| FunctionError::DecodePatch(e.to_string()))
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.message.as_deref())
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.as_ref().and_then(|s| s.code)
    }
}
