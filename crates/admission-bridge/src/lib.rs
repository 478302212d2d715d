pub mod admission_review;
mod api;
pub mod bus;
mod certs;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod tracing;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use admission_functions::{DecisionFunction, MutatingFunction, ValidatingFunction};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::{self, TraceLayer};
use ::tracing::{info, Level};

use crate::api::{
    handlers::{mutate_handler, readiness_handler, validate_handler},
    state::ApiServerState,
};
use crate::bus::InProcessBus;
use crate::config::{Config, TlsConfig, SERVICE_NAME};
use crate::dispatch::Correlator;

fn routes(state: Arc<ApiServerState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/validate", post(validate_handler))
        .route("/readiness", get(readiness_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}

pub struct AdmissionBridge {
    router: Router,
    addr: SocketAddr,
    tls_config: Option<TlsConfig>,
    correlator: Arc<Correlator>,
}

impl AdmissionBridge {
    /// Wire the decision functions, the message bus and the HTTP routes.
    /// Must be called from within a tokio runtime.
    pub async fn new_from_config(config: Config) -> Result<Self> {
        let functions: HashMap<String, Arc<dyn DecisionFunction>> = HashMap::from([
            (
                config.topics.mutate.clone(),
                Arc::new(MutatingFunction::new(
                    config.resource_policy,
                    config.injection_config,
                )) as Arc<dyn DecisionFunction>,
            ),
            (
                config.topics.validate.clone(),
                Arc::new(ValidatingFunction::new(config.label_policy)) as Arc<dyn DecisionFunction>,
            ),
        ]);
        for (topic, function) in &functions {
            info!(topic = topic.as_str(), function = function.name(), "decision function registered");
        }

        let bus = InProcessBus::start(functions, config.bus_queue_size, config.workers);
        let correlator = Correlator::new(Arc::new(bus), config.dispatch);
        let dispatch = correlator.settings();
        info!(
            attempt_timeout_ms = dispatch.attempt_timeout.as_millis() as u64,
            max_attempts = dispatch.max_attempts,
            queue_size = config.bus_queue_size,
            workers = config.workers,
            "message bus ready"
        );

        let state = Arc::new(ApiServerState {
            correlator: correlator.clone(),
            topics: config.topics,
        });

        Ok(Self {
            router: routes(state),
            addr: config.addr,
            tls_config: config.tls_config,
            correlator,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Number of admission requests waiting for a decision
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending()
    }

    pub async fn run(self) -> Result<()> {
        let app = self.router.into_make_service();

        match self.tls_config {
            Some(tls_config) => {
                let rustls_config = certs::create_tls_config(&tls_config).await?;
                info!(address = %self.addr, service = SERVICE_NAME, "started HTTPS server");
                axum_server::bind_rustls(self.addr, rustls_config)
                    .serve(app)
                    .await?;
            }
            None => {
                info!(address = %self.addr, service = SERVICE_NAME, "started HTTP server");
                axum_server::bind(self.addr).serve(app).await?;
            }
        }

        Ok(())
    }
}
