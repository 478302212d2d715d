use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use admission_functions::{
    admission_request::AdmissionRequest, admission_response::AdmissionResponse,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{InvocationReply, MessageBus, ReplyOutcome, ResponseReceiver};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no response from topic {topic} after {attempts} attempts")]
    Timeout { topic: String, attempts: u32 },
    #[error("decision function failed: {0}")]
    FunctionFailed(String),
    #[error("invalid reply from decision function: {0}")]
    InvalidReply(String),
    #[error("admission request {0} is already being processed")]
    AlreadyPending(String),
    #[error("cannot serialize admission request: {0}")]
    SerializeRequest(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// How long to wait for a reply before publishing the request again
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

type Completion = Result<AdmissionResponse, DispatchError>;

struct PendingCorrelation {
    /// Distinguishes two correlations that, one after the other, used the same UID
    id: u64,
    completion: oneshot::Sender<Completion>,
    created_at: Instant,
    attempts: u32,
}

/// Bridges a synchronous admission call to the asynchronous replies of the message bus.
///
/// Every in-flight call owns a one-shot slot keyed by the UID of its admission request.
/// Replies are routed to the slot with the same UID, everything else is dropped.
pub struct Correlator {
    bus: Arc<dyn MessageBus>,
    settings: DispatchSettings,
    pending: Mutex<HashMap<String, PendingCorrelation>>,
    next_id: AtomicU64,
}

/// Removes the pending slot when the call ends, whatever the way it ends
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    uid: String,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.correlator.lock();
        if pending.get(&self.uid).is_some_and(|p| p.id == self.id) {
            pending.remove(&self.uid);
            debug!(request_uid = self.uid.as_str(), "pending correlation released");
        }
    }
}

impl Correlator {
    /// Create the correlator and subscribe it to the replies of the bus
    pub fn new(bus: Arc<dyn MessageBus>, settings: DispatchSettings) -> Arc<Self> {
        let correlator = Arc::new(Correlator {
            bus: bus.clone(),
            settings,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        bus.subscribe(correlator.clone());

        correlator
    }

    /// Number of calls waiting for a reply
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCorrelation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, uid: &str) -> Result<(PendingGuard<'_>, oneshot::Receiver<Completion>), DispatchError> {
        let mut pending = self.lock();
        if pending.contains_key(uid) {
            return Err(DispatchError::AlreadyPending(uid.to_owned()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, receiver) = oneshot::channel();
        pending.insert(
            uid.to_owned(),
            PendingCorrelation {
                id,
                completion,
                created_at: Instant::now(),
                attempts: 0,
            },
        );

        Ok((
            PendingGuard {
                correlator: self,
                uid: uid.to_owned(),
                id,
            },
            receiver,
        ))
    }

    fn record_attempt(&self, uid: &str, attempt: u32) {
        if let Some(pending) = self.lock().get_mut(uid) {
            pending.attempts = attempt;
        }
    }

    /// Publish the request on `topic` and wait for the matching reply.
    ///
    /// The request is published again every time `attempt_timeout` elapses without a
    /// reply, up to `max_attempts` times. A reply to an earlier attempt that arrives
    /// late is still accepted.
    pub async fn resolve(
        &self,
        request: &AdmissionRequest,
        topic: &str,
    ) -> Result<AdmissionResponse, DispatchError> {
        let payload = serde_json::to_vec(request).map_err(DispatchError::SerializeRequest)?;
        let (_guard, mut receiver) = self.register(&request.uid)?;

        for attempt in 1..=self.settings.max_attempts {
            self.record_attempt(&request.uid, attempt);

            if let Err(e) = self.bus.invoke(topic, payload.clone()) {
                warn!(
                    request_uid = request.uid.as_str(),
                    topic,
                    attempt,
                    error = %e,
                    "cannot publish admission request"
                );
            }

            match tokio::time::timeout(self.settings.attempt_timeout, &mut receiver).await {
                Ok(Ok(completion)) => return completion,
                // the sender lives in the pending table until a reply consumes it
                Ok(Err(_)) => break,
                Err(_) => debug!(
                    request_uid = request.uid.as_str(),
                    topic,
                    attempt,
                    "no reply within the attempt timeout"
                ),
            }
        }

        Err(DispatchError::Timeout {
            topic: topic.to_owned(),
            attempts: self.settings.max_attempts,
        })
    }
}

fn reply_uid(reply: &InvocationReply, parsed: Option<&AdmissionResponse>) -> Option<String> {
    reply
        .uid
        .clone()
        .or_else(|| parsed.map(|response| response.uid.clone()))
        .filter(|uid| !uid.is_empty())
}

impl ResponseReceiver for Correlator {
    fn response(&self, reply: InvocationReply) {
        let parsed = match &reply.outcome {
            ReplyOutcome::Body(body) => Some(serde_json::from_slice::<AdmissionResponse>(body)),
            ReplyOutcome::Error(_) => None,
        };

        let Some(uid) = reply_uid(&reply, parsed.as_ref().and_then(|p| p.as_ref().ok())) else {
            debug!(
                topic = reply.topic.as_str(),
                function = reply.function.as_str(),
                "reply without correlation uid dropped"
            );
            return;
        };

        let Some(pending) = self.lock().remove(&uid) else {
            debug!(
                request_uid = uid.as_str(),
                topic = reply.topic.as_str(),
                "no pending request for reply, dropping it"
            );
            return;
        };

        let completion = match (reply.outcome, parsed) {
            (ReplyOutcome::Error(message), _) => Err(DispatchError::FunctionFailed(message)),
            (_, Some(Ok(response))) => Ok(response),
            (_, Some(Err(e))) => Err(DispatchError::InvalidReply(e.to_string())),
            (ReplyOutcome::Body(_), None) => {
                Err(DispatchError::InvalidReply("empty reply".to_string()))
            }
        };

        debug!(
            request_uid = uid.as_str(),
            function = reply.function.as_str(),
            attempts = pending.attempts,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "reply received"
        );
        if pending.completion.send(completion).is_err() {
            debug!(request_uid = uid.as_str(), "caller went away before the reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MockMessageBus};
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            attempt_timeout: Duration::from_millis(50),
            max_attempts: 3,
        }
    }

    fn request(uid: &str) -> AdmissionRequest {
        AdmissionRequest {
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    fn body_reply(uid: Option<&str>, response: &AdmissionResponse) -> InvocationReply {
        InvocationReply {
            topic: "validate".to_string(),
            function: "validate".to_string(),
            uid: uid.map(String::from),
            outcome: ReplyOutcome::Body(serde_json::to_vec(response).unwrap()),
        }
    }

    /// Replies to every invocation after the first `skip` ones, after a delay
    struct ScriptedBus {
        receiver: Mutex<Option<Arc<dyn ResponseReceiver>>>,
        invocations: AtomicUsize,
        skip: usize,
        outcome: fn(&AdmissionRequest) -> ReplyOutcome,
        delay: fn(&AdmissionRequest) -> Duration,
    }

    impl ScriptedBus {
        fn new(skip: usize, outcome: fn(&AdmissionRequest) -> ReplyOutcome) -> Self {
            ScriptedBus {
                receiver: Mutex::new(None),
                invocations: AtomicUsize::new(0),
                skip,
                outcome,
                delay: |_| Duration::from_millis(1),
            }
        }

        fn allowing() -> Self {
            ScriptedBus::new(0, |req| {
                ReplyOutcome::Body(
                    serde_json::to_vec(&AdmissionResponse::allow(req.uid.clone())).unwrap(),
                )
            })
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    impl MessageBus for ScriptedBus {
        fn invoke(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.skip {
                return Ok(());
            }

            let request: AdmissionRequest = serde_json::from_slice(&payload).unwrap();
            let receiver = self.receiver.lock().unwrap().clone().unwrap();
            let delay = (self.delay)(&request);
            let reply = InvocationReply {
                topic: topic.to_string(),
                function: topic.to_string(),
                uid: Some(request.uid.clone()),
                outcome: (self.outcome)(&request),
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                receiver.response(reply);
            });
            Ok(())
        }

        fn subscribe(&self, receiver: Arc<dyn ResponseReceiver>) {
            *self.receiver.lock().unwrap() = Some(receiver);
        }
    }

    fn silent_bus(invocations: usize) -> MockMessageBus {
        let mut bus = MockMessageBus::new();
        bus.expect_subscribe().times(1).return_const(());
        bus.expect_invoke()
            .times(invocations)
            .returning(|_, _| Ok(()));
        bus
    }

    #[tokio::test]
    async fn reply_completes_the_call() {
        let bus = Arc::new(ScriptedBus::allowing());
        let correlator = Correlator::new(bus.clone(), settings());

        let response = correlator.resolve(&request("abc"), "validate").await.unwrap();

        assert!(response.allowed);
        assert_eq!(response.uid, "abc");
        assert_eq!(bus.invocations(), 1);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_after_max_attempts() {
        let correlator = Correlator::new(Arc::new(silent_bus(3)), settings());

        let started = Instant::now();
        let err = correlator
            .resolve(&request("abc"), "validate")
            .await
            .unwrap_err();

        assert!(
            matches!(err, DispatchError::Timeout { ref topic, attempts: 3 } if topic == "validate")
        );
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn publish_failures_count_as_attempts() {
        let mut bus = MockMessageBus::new();
        bus.expect_subscribe().times(1).return_const(());
        bus.expect_invoke()
            .times(3)
            .returning(|_, _| Err(BusError::Full));
        let correlator = Correlator::new(Arc::new(bus), settings());

        let err = correlator
            .resolve(&request("abc"), "validate")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { attempts: 3, .. }));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn request_is_published_again_on_miss() {
        let bus = Arc::new(ScriptedBus::new(1, |req| {
            ReplyOutcome::Body(serde_json::to_vec(&AdmissionResponse::allow(req.uid.clone())).unwrap())
        }));
        let correlator = Correlator::new(bus.clone(), settings());

        let response = correlator.resolve(&request("abc"), "validate").await.unwrap();

        assert!(response.allowed);
        assert_eq!(bus.invocations(), 2);
    }

    #[tokio::test]
    async fn function_error_is_not_a_timeout() {
        let bus = Arc::new(ScriptedBus::new(0, |_| ReplyOutcome::Error("boom".to_string())));
        let correlator = Correlator::new(bus, settings());

        let err = correlator
            .resolve(&request("abc"), "validate")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::FunctionFailed(ref msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn undecodable_reply_body() {
        let bus = Arc::new(ScriptedBus::new(0, |_| ReplyOutcome::Body(b"nope".to_vec())));
        let correlator = Correlator::new(bus, settings());

        let err = correlator
            .resolve(&request("abc"), "validate")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidReply(_)));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn uid_already_pending() {
        let correlator = Correlator::new(Arc::new(silent_bus(0)), settings());
        let (_guard, _receiver) = correlator.register("abc").unwrap();

        let err = correlator
            .resolve(&request("abc"), "validate")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::AlreadyPending(ref uid) if uid == "abc"));
        // the rejected call must not release the slot of the first one
        assert_eq!(correlator.pending(), 1);
    }

    #[tokio::test]
    async fn unmatched_and_duplicate_replies_are_dropped() {
        let correlator = Correlator::new(Arc::new(silent_bus(0)), settings());

        correlator.response(body_reply(Some("unknown"), &AdmissionResponse::allow("unknown".to_string())));
        assert_eq!(correlator.pending(), 0);

        let (_guard, receiver) = correlator.register("abc").unwrap();
        correlator.response(body_reply(Some("abc"), &AdmissionResponse::allow("abc".to_string())));
        correlator.response(body_reply(
            Some("abc"),
            &AdmissionResponse::reject("abc".to_string(), "late".to_string(), 403),
        ));

        let response = receiver.await.unwrap().unwrap();
        assert!(response.allowed);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn uid_falls_back_to_the_response_body() {
        let correlator = Correlator::new(Arc::new(silent_bus(0)), settings());
        let (_guard, receiver) = correlator.register("abc").unwrap();

        correlator.response(body_reply(None, &AdmissionResponse::allow("abc".to_string())));

        assert!(receiver.await.unwrap().unwrap().allowed);
    }

    #[tokio::test]
    async fn cancelled_call_leaves_nothing_behind() {
        let correlator = Correlator::new(Arc::new(silent_bus(1)), settings());

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            correlator.resolve(&request("abc"), "validate"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_get_their_own_reply() {
        let mut bus = ScriptedBus::allowing();
        // later requests are answered first
        bus.delay = |req| {
            let index: u64 = req.uid.trim_start_matches("uid-").parse().unwrap();
            Duration::from_millis(20 - index)
        };
        let correlator = Correlator::new(Arc::new(bus), settings());

        let requests: Vec<AdmissionRequest> = (0..20).map(|i| request(&format!("uid-{i}"))).collect();
        let responses = join_all(
            requests
                .iter()
                .map(|req| correlator.resolve(req, "validate")),
        )
        .await;

        for (req, response) in requests.iter().zip(responses) {
            assert_eq!(response.unwrap().uid, req.uid);
        }
        assert_eq!(correlator.pending(), 0);
    }
}
