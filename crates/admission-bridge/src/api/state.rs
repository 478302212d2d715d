use std::sync::Arc;

use crate::config::Topics;
use crate::dispatch::Correlator;

pub(crate) struct ApiServerState {
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) topics: Topics,
}
