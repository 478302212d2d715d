use std::{net::SocketAddr, time::Duration};

use admission_bridge::{
    config::{Config, Topics},
    dispatch::DispatchSettings,
    AdmissionBridge,
};
use admission_functions::{
    labels::LabelPolicy, resources::ResourcePolicy, volumes::InjectionConfig,
};
use axum::Router;

pub(crate) fn default_test_config() -> Config {
    Config {
        addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
        tls_config: None,
        topics: Topics::default(),
        dispatch: DispatchSettings {
            attempt_timeout: Duration::from_millis(500),
            max_attempts: 3,
        },
        bus_queue_size: 16,
        workers: 2,
        resource_policy: ResourcePolicy::default(),
        injection_config: InjectionConfig::default(),
        label_policy: LabelPolicy::default(),
        log_level: "info".to_owned(),
        log_fmt: "json".to_owned(),
        log_no_color: false,
    }
}

pub(crate) async fn app(config: Config) -> Router {
    let bridge = AdmissionBridge::new_from_config(config).await.unwrap();

    bridge.router()
}
