use std::fmt;

use serde::de::DeserializeOwned;

use crate::errors::{FunctionError, Result};

/// This models the admission/v1/AdmissionRequest object of Kubernetes.
/// The request is never mutated once it has been received.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub resource: GroupVersionResource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: k8s_openapi::api::authentication::v1::UserInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<k8s_openapi::apimachinery::pkg::runtime::RawExtension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_object: Option<k8s_openapi::apimachinery::pkg::runtime::RawExtension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<k8s_openapi::apimachinery::pkg::runtime::RawExtension>,
}

impl AdmissionRequest {
    /// Decode the object under review into a typed Kubernetes resource.
    /// Returns `None` when the request carries no object, which happens with DELETE operations.
    pub fn decode_object<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.object {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.0.clone())
                .map(Some)
                .map_err(|e| FunctionError::Deserialize {
                    kind: self.kind.kind.clone(),
                    source: e,
                }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
}

/// The operation being performed on the object under review
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[default]
    Create,
    Update,
    Delete,
    Connect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Connect => write!(f, "CONNECT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    fn request_with_object(object: Option<serde_json::Value>) -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "abc",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": "default",
            "operation": "CREATE",
            "object": object,
        }))
        .expect("cannot build admission request")
    }

    #[test]
    fn deserialize_minimal_request() {
        let request: AdmissionRequest = serde_json::from_value(json!({
            "uid": "hello",
            "kind": {"kind": "Pod"},
            "operation": "UPDATE",
        }))
        .unwrap();

        assert_eq!(request.uid, "hello");
        assert_eq!(request.kind.kind, "Pod");
        assert_eq!(request.operation, Operation::Update);
        assert!(request.object.is_none());
    }

    #[test]
    fn decode_object_into_typed_resource() {
        let request = request_with_object(Some(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "nginx", "namespace": "default"},
            "spec": {"containers": [{"name": "nginx", "image": "nginx"}]}
        })));

        let pod: Pod = request.decode_object().unwrap().unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("nginx"));
        assert_eq!(pod.spec.unwrap().containers.len(), 1);
    }

    #[test]
    fn decode_missing_object() {
        let request = request_with_object(None);
        let pod: Option<Pod> = request.decode_object().unwrap();
        assert!(pod.is_none());
    }

    #[test]
    fn decode_object_with_wrong_shape() {
        let request = request_with_object(Some(json!({
            "metadata": {"name": "nginx"},
            "spec": {"containers": "not a list"}
        })));

        let result: Result<Option<Pod>> = request.decode_object();
        assert!(matches!(result, Err(FunctionError::Deserialize { kind, .. }) if kind == "Pod"));
    }
}
