use std::{fs::File, path::Path};

use serde::de::DeserializeOwned;

use crate::errors::{FunctionError, Result};

/// Reads a YAML settings file into the given type
pub(crate) fn read_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let configuration_error = |message: String| FunctionError::Configuration {
        path: path.display().to_string(),
        message,
    };

    let file = File::open(path).map_err(|e| configuration_error(e.to_string()))?;
    serde_yaml::from_reader(file).map_err(|e| configuration_error(e.to_string()))
}
