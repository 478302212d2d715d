use std::path::Path;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Pod, Volume, VolumeMount};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{FunctionError, Result};
use crate::settings::read_yaml_file;

/// Volumes and volume mounts injected into every admitted Pod.
/// The mounts are added to the first container of the Pod.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectionConfig {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        InjectionConfig {
            volumes: vec![Volume {
                name: "hello-volume".to_string(),
                config_map: serde_json::from_value(json!({"name": "hello-configmap"})).ok(),
                ..Default::default()
            }],
            volume_mounts: vec![VolumeMount {
                name: "hello-volume".to_string(),
                mount_path: "/etc/config".to_string(),
                read_only: Some(true),
                ..Default::default()
            }],
        }
    }
}

impl InjectionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_yaml_file(path)
    }
}

/// Build the patch that injects the configured volumes and mounts into a Pod.
///
/// A JSON Patch `add` cannot append to an array that does not exist yet: when the target
/// list is empty the first item is added by creating the whole array, every following item
/// is appended with the `-` reference token.
pub fn compile_volume_injection(pod: &Pod, config: &InjectionConfig) -> Result<Patch> {
    let mut operations = Vec::new();

    let Some(spec) = pod.spec.as_ref() else {
        return Ok(Patch(operations));
    };

    let existing_volumes: Vec<&str> = spec
        .volumes
        .iter()
        .flatten()
        .map(|v| v.name.as_str())
        .collect();
    inject(
        &mut operations,
        PointerBuf::from_tokens(["spec", "volumes"]),
        &existing_volumes,
        config.volumes.iter().map(|v| (v.name.as_str(), v)),
    )?;

    match spec.containers.first() {
        Some(container) => {
            let existing_mounts: Vec<&str> = container
                .volume_mounts
                .iter()
                .flatten()
                .map(|m| m.name.as_str())
                .collect();
            inject(
                &mut operations,
                PointerBuf::from_tokens(["spec", "containers", "0", "volumeMounts"]),
                &existing_mounts,
                config.volume_mounts.iter().map(|m| (m.name.as_str(), m)),
            )?;
        }
        None => debug!("pod has no containers, skipping volume mounts"),
    }

    Ok(Patch(operations))
}

fn inject<'a, T: Serialize + 'a>(
    operations: &mut Vec<PatchOperation>,
    path: PointerBuf,
    existing: &[&str],
    items: impl Iterator<Item = (&'a str, &'a T)>,
) -> Result<()> {
    let mut empty = existing.is_empty();

    for (name, item) in items {
        if existing.contains(&name) {
            debug!(item = name, path = path.as_str(), "already present, not injecting");
            continue;
        }

        let value = serde_json::to_value(item).map_err(FunctionError::SerializePatch)?;
        let operation = if empty {
            empty = false;
            AddOperation {
                path: path.clone(),
                value: Value::Array(vec![value]),
            }
        } else {
            AddOperation {
                path: path.with_trailing_token("-"),
                value,
            }
        };
        operations.push(PatchOperation::Add(operation));
    }

    Ok(())
}
