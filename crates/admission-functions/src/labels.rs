use std::path::Path;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::Result;
use crate::settings::read_yaml_file;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const VALIDATE_ANNOTATION_KEY: &str = "admission-bridge.io/validate";

pub const MISSING_LABELS_REASON: &str = "required labels are not set";

/// Annotation values that opt an object out of the label policy
const OPT_OUT_VALUES: [&str; 4] = ["n", "no", "false", "off"];

/// Static configuration of the required labels policy
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelPolicy {
    /// Label keys that must be set, checked in this order
    #[serde(default = "default_required_labels")]
    pub required_labels: Vec<String>,
    /// Namespaces where the policy is never enforced
    #[serde(default = "default_ignored_namespaces")]
    pub ignored_namespaces: Vec<String>,
    /// Annotation that can disable enforcement for a single object
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,
}

fn default_required_labels() -> Vec<String> {
    [
        NAME_LABEL,
        INSTANCE_LABEL,
        VERSION_LABEL,
        COMPONENT_LABEL,
        PART_OF_LABEL,
        MANAGED_BY_LABEL,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_ignored_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "kube-public".to_string()]
}

fn default_annotation_key() -> String {
    VALIDATE_ANNOTATION_KEY.to_string()
}

impl Default for LabelPolicy {
    fn default() -> Self {
        LabelPolicy {
            required_labels: default_required_labels(),
            ignored_namespaces: default_ignored_namespaces(),
            annotation_key: default_annotation_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Decision {
    fn allow() -> Self {
        Decision {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

impl LabelPolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_yaml_file(path)
    }

    /// Whether the policy has to be enforced on the given object
    fn enforcement_required(&self, metadata: &ObjectMeta, namespace: &str) -> bool {
        if self.ignored_namespaces.iter().any(|ns| ns == namespace) {
            info!(
                name = metadata.name.as_deref().unwrap_or_default(),
                namespace, "skip validation, object is inside of an ignored namespace"
            );
            return false;
        }

        let opt_out = metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.annotation_key))
            .map(|value| value.to_lowercase())
            .is_some_and(|value| OPT_OUT_VALUES.contains(&value.as_str()));

        !opt_out
    }

    /// Evaluate the object metadata against the policy.
    ///
    /// `fallback_namespace` is used when the object does not carry its namespace, which is
    /// common for objects being created.
    pub fn evaluate(&self, metadata: &ObjectMeta, fallback_namespace: Option<&str>) -> Decision {
        let namespace = metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .or(fallback_namespace)
            .unwrap_or_default();

        let required = self.enforcement_required(metadata, namespace);
        info!(
            namespace,
            name = metadata.name.as_deref().unwrap_or_default(),
            required,
            "validation policy"
        );
        if !required {
            return Decision::allow();
        }

        let labels = metadata.labels.as_ref();
        let missing = self
            .required_labels
            .iter()
            .find(|label| !labels.is_some_and(|l| l.contains_key(label.as_str())));

        match missing {
            Some(label) => {
                debug!(label = label.as_str(), "required label is missing");
                Decision::deny(MISSING_LABELS_REASON)
            }
            None => Decision::allow(),
        }
    }
}
