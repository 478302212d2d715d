use std::{collections::BTreeMap, path::Path};

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::Result;
use crate::settings::read_yaml_file;

const MEMORY: &str = "memory";
const CPU: &str = "cpu";

/// How the default resources are applied to a container
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultsMode {
    /// Only containers without any request and any limit are patched, with the whole
    /// `resources` stanza.
    #[default]
    Coarse,
    /// Each one of requests.memory, requests.cpu, limits.memory and limits.cpu is
    /// defaulted independently.
    Fine,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuantities {
    pub memory: String,
    pub cpu: String,
}

impl ResourceQuantities {
    fn get(&self, resource: &str) -> &str {
        match resource {
            MEMORY => &self.memory,
            _ => &self.cpu,
        }
    }

    fn to_json(&self) -> Value {
        json!({ "cpu": self.cpu, "memory": self.memory })
    }
}

/// Default CPU and memory quantities injected into Deployment containers
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicy {
    #[serde(default)]
    pub mode: DefaultsMode,
    #[serde(default = "default_requests")]
    pub requests: ResourceQuantities,
    #[serde(default = "default_limits")]
    pub limits: ResourceQuantities,
}

fn default_requests() -> ResourceQuantities {
    ResourceQuantities {
        memory: "50Mi".to_string(),
        cpu: "100m".to_string(),
    }
}

fn default_limits() -> ResourceQuantities {
    ResourceQuantities {
        memory: "75Mi".to_string(),
        cpu: "125m".to_string(),
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        ResourcePolicy {
            mode: DefaultsMode::default(),
            requests: default_requests(),
            limits: default_limits(),
        }
    }
}

impl ResourcePolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_yaml_file(path)
    }

    fn full_requirements(&self) -> Value {
        json!({
            "limits": self.limits.to_json(),
            "requests": self.requests.to_json(),
        })
    }
}

fn is_unset(list: Option<&BTreeMap<String, Quantity>>) -> bool {
    list.map_or(true, |l| l.is_empty())
}

fn add(path: PointerBuf, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

/// Build the patch that sets the default resources on the containers of a Deployment.
/// Patches are emitted by ascending container index.
pub fn compile_resource_defaults(deployment: &Deployment, policy: &ResourcePolicy) -> Patch {
    let mut operations = Vec::new();

    let containers = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod_spec| pod_spec.containers.as_slice())
        .unwrap_or_default();

    for (index, container) in containers.iter().enumerate() {
        let mut base = PointerBuf::from_tokens(["spec", "template", "spec", "containers"]);
        base.push_back(index);
        base.push_back("resources");

        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());

        if is_unset(requests) && is_unset(limits) {
            operations.push(add(base, policy.full_requirements()));
            continue;
        }

        if policy.mode == DefaultsMode::Coarse {
            continue;
        }

        for (section, current, defaults) in [
            ("requests", requests, &policy.requests),
            ("limits", limits, &policy.limits),
        ] {
            let section_path = base.with_trailing_token(section);
            match current {
                // the parent map does not exist, a pointer to one of its keys would not resolve
                None => operations.push(add(section_path, defaults.to_json())),
                Some(current) => {
                    for resource in [MEMORY, CPU] {
                        if !current.contains_key(resource) {
                            operations.push(add(
                                section_path.with_trailing_token(resource),
                                json!(defaults.get(resource)),
                            ));
                        }
                    }
                }
            }
        }
    }

    Patch(operations)
}
