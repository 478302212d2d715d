use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use admission_functions::{
    labels::LabelPolicy, resources::ResourcePolicy, volumes::InjectionConfig,
};
use anyhow::{anyhow, Result};
use clap::ArgMatches;
use lazy_static::lazy_static;

use crate::dispatch::DispatchSettings;

pub static SERVICE_NAME: &str = "admission-bridge";

lazy_static! {
    pub(crate) static ref HOSTNAME: String =
        std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("unknown"));
}

pub struct Config {
    pub addr: SocketAddr,
    pub tls_config: Option<TlsConfig>,
    pub topics: Topics,
    pub dispatch: DispatchSettings,
    pub bus_queue_size: usize,
    pub workers: usize,
    pub resource_policy: ResourcePolicy,
    pub injection_config: InjectionConfig,
    pub label_policy: LabelPolicy,
    pub log_level: String,
    pub log_fmt: String,
    pub log_no_color: bool,
}

pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Message bus topics the decision functions listen on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub mutate: String,
    pub validate: String,
}

impl Default for Topics {
    fn default() -> Self {
        Topics {
            mutate: "mutate".to_owned(),
            validate: "validate".to_owned(),
        }
    }
}

impl Config {
    pub fn from_args(matches: &ArgMatches) -> Result<Self> {
        let addr = api_bind_address(matches)?;
        let (cert_file, key_file) = tls_files(matches)?;
        let tls_config = if cert_file.is_empty() {
            None
        } else {
            Some(TlsConfig {
                cert_file,
                key_file,
            })
        };

        let topics = Topics {
            mutate: matches
                .get_one::<String>("mutate-topic")
                .expect("This should not happen, there's a default value for mutate-topic")
                .to_owned(),
            validate: matches
                .get_one::<String>("validate-topic")
                .expect("This should not happen, there's a default value for validate-topic")
                .to_owned(),
        };
        if topics.mutate == topics.validate {
            return Err(anyhow!(
                "error parsing arguments: mutate and validate topics must differ, both are {}",
                topics.mutate
            ));
        }

        let dispatch = dispatch_settings(matches)?;
        let bus_queue_size = parse_number::<usize>(matches, "bus-queue-size")?;
        let workers = match matches.get_one::<String>("workers") {
            Some(_) => parse_number::<usize>(matches, "workers")?,
            None => num_cpus::get(),
        };
        if workers == 0 {
            return Err(anyhow!("error parsing arguments: workers must be greater than zero"));
        }

        let resource_policy = match matches.get_one::<String>("resource-policy") {
            Some(path) => ResourcePolicy::from_file(Path::new(path))?,
            None => ResourcePolicy::default(),
        };
        let injection_config = match matches.get_one::<String>("sidecar-config") {
            Some(path) => InjectionConfig::from_file(Path::new(path))?,
            None => InjectionConfig::default(),
        };
        let label_policy = match matches.get_one::<String>("label-policy") {
            Some(path) => LabelPolicy::from_file(Path::new(path))?,
            None => LabelPolicy::default(),
        };

        let log_level = matches
            .get_one::<String>("log-level")
            .expect("This should not happen, there's a default value for log-level")
            .to_owned();
        let log_fmt = matches
            .get_one::<String>("log-fmt")
            .expect("This should not happen, there's a default value for log-fmt")
            .to_owned();
        let log_no_color = matches
            .get_one::<bool>("log-no-color")
            .expect("clap should have assigned a default value")
            .to_owned();

        Ok(Self {
            addr,
            tls_config,
            topics,
            dispatch,
            bus_queue_size,
            workers,
            resource_policy,
            injection_config,
            label_policy,
            log_level,
            log_fmt,
            log_no_color,
        })
    }
}

fn api_bind_address(matches: &clap::ArgMatches) -> Result<SocketAddr> {
    format!(
        "{}:{}",
        matches
            .get_one::<String>("address")
            .expect("This should not happen, there's a default value for address"),
        matches
            .get_one::<String>("port")
            .expect("This should not happen, there's a default value for port")
    )
    .parse()
    .map_err(|e| anyhow!("error parsing arguments: {}", e))
}

fn tls_files(matches: &clap::ArgMatches) -> Result<(String, String)> {
    let cert_file = matches
        .get_one::<String>("cert-file")
        .cloned()
        .unwrap_or_default();
    let key_file = matches
        .get_one::<String>("key-file")
        .cloned()
        .unwrap_or_default();
    if cert_file.is_empty() != key_file.is_empty() {
        Err(anyhow!("error parsing arguments: either both --cert-file and --key-file must be provided, or neither"))
    } else {
        Ok((cert_file, key_file))
    }
}

fn parse_number<T>(matches: &clap::ArgMatches, id: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = matches
        .get_one::<String>(id)
        .ok_or_else(|| anyhow!("error parsing arguments: {} is not set", id))?;
    value
        .parse::<T>()
        .map_err(|e| anyhow!("error parsing arguments: invalid {} {:?}: {}", id, value, e))
}

fn dispatch_settings(matches: &clap::ArgMatches) -> Result<DispatchSettings> {
    let attempt_timeout_ms = parse_number::<u64>(matches, "dispatch-attempt-timeout-ms")?;
    let max_attempts = parse_number::<u32>(matches, "dispatch-max-attempts")?;
    if attempt_timeout_ms == 0 || max_attempts == 0 {
        return Err(anyhow!(
            "error parsing arguments: dispatch attempt timeout and max attempts must be greater than zero"
        ));
    }

    Ok(DispatchSettings {
        attempt_timeout: Duration::from_millis(attempt_timeout_ms),
        max_attempts,
    })
}
