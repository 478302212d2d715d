use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use admission_functions::{admission_request::AdmissionRequest, DecisionFunction};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, error, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no decision function is listening on topic {0}")]
    UnknownTopic(String),
    #[error("invocation queue is full")]
    Full,
    #[error("message bus is closed")]
    Closed,
}

/// What a decision function produced for a single invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Serialized `AdmissionResponse`
    Body(Vec<u8>),
    /// The function failed, the message describes why
    Error(String),
}

/// A reply delivered by the bus to its subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReply {
    pub topic: String,
    pub function: String,
    /// Correlation header echoed by the function runtime. When missing, the
    /// UID carried by the response body is used.
    pub uid: Option<String>,
    pub outcome: ReplyOutcome,
}

pub trait ResponseReceiver: Send + Sync {
    fn response(&self, reply: InvocationReply);
}

/// Fire-and-forget invocation of decision functions. Replies are delivered
/// asynchronously to every subscribed receiver, in no particular order.
#[cfg_attr(test, mockall::automock)]
pub trait MessageBus: Send + Sync {
    fn invoke(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    fn subscribe(&self, receiver: Arc<dyn ResponseReceiver>);
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn ResponseReceiver>>>>;

struct Invocation {
    topic: String,
    payload: Vec<u8>,
}

/// A message bus hosting the decision functions inside of the current process.
///
/// Invocations are queued on a bounded channel drained by a tokio task. Each
/// one is evaluated on the blocking thread pool, since decision functions are
/// synchronous code. At most `workers` evaluations run at the same time, the
/// others wait in the queue.
pub struct InProcessBus {
    topics: Vec<String>,
    sender: mpsc::Sender<Invocation>,
    subscribers: Subscribers,
}

impl InProcessBus {
    /// Spawn the task serving the invocations. Must be called from within a tokio runtime.
    pub fn start(
        functions: HashMap<String, Arc<dyn DecisionFunction>>,
        queue_size: usize,
        workers: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let mut topics: Vec<String> = functions.keys().cloned().collect();
        topics.sort();

        let workers = Arc::new(Semaphore::new(workers.max(1)));
        tokio::spawn(serve(receiver, functions, subscribers.clone(), workers));

        InProcessBus {
            topics,
            sender,
            subscribers,
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl MessageBus for InProcessBus {
    fn invoke(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.topics.iter().any(|t| t == topic) {
            return Err(BusError::UnknownTopic(topic.to_owned()));
        }

        self.sender
            .try_send(Invocation {
                topic: topic.to_owned(),
                payload,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => BusError::Full,
                TrySendError::Closed(_) => BusError::Closed,
            })
    }

    fn subscribe(&self, receiver: Arc<dyn ResponseReceiver>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(receiver);
    }
}

async fn serve(
    mut receiver: mpsc::Receiver<Invocation>,
    functions: HashMap<String, Arc<dyn DecisionFunction>>,
    subscribers: Subscribers,
    workers: Arc<Semaphore>,
) {
    loop {
        // the queue is drained only when a worker is free
        let Ok(permit) = workers.clone().acquire_owned().await else {
            break;
        };
        let Some(invocation) = receiver.recv().await else {
            break;
        };
        let Some(function) = functions.get(&invocation.topic).cloned() else {
            warn!(topic = invocation.topic.as_str(), "invocation for unknown topic");
            continue;
        };
        let subscribers = subscribers.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let topic = invocation.topic;
            let name = function.name().to_owned();

            let request: AdmissionRequest = match serde_json::from_slice(&invocation.payload) {
                Ok(request) => request,
                Err(e) => {
                    broadcast(
                        &subscribers,
                        InvocationReply {
                            topic,
                            function: name,
                            uid: None,
                            outcome: ReplyOutcome::Error(format!(
                                "cannot decode admission request: {e}"
                            )),
                        },
                    );
                    return;
                }
            };
            let uid = request.uid.clone();

            let outcome =
                match task::spawn_blocking(move || evaluate(function.as_ref(), &request)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            topic = topic.as_str(),
                            request_uid = uid.as_str(),
                            error = %e,
                            "decision function panicked"
                        );
                        ReplyOutcome::Error(format!("decision function {name} panicked"))
                    }
                };

            broadcast(
                &subscribers,
                InvocationReply {
                    topic,
                    function: name,
                    uid: Some(uid),
                    outcome,
                },
            );
        });
    }
    debug!("invocation queue closed");
}

fn evaluate(function: &dyn DecisionFunction, request: &AdmissionRequest) -> ReplyOutcome {
    match function.decide(request) {
        Ok(response) => match serde_json::to_vec(&response) {
            Ok(body) => ReplyOutcome::Body(body),
            Err(e) => ReplyOutcome::Error(format!("cannot serialize admission response: {e}")),
        },
        Err(e) => {
            warn!(
                function = function.name(),
                request_uid = request.uid.as_str(),
                error = %e,
                "decision function failed"
            );
            ReplyOutcome::Error(e.to_string())
        }
    }
}

fn broadcast(subscribers: &Subscribers, reply: InvocationReply) {
    let subscribers = subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    if subscribers.is_empty() {
        debug!(topic = reply.topic.as_str(), "no subscriber, reply discarded");
    }
    for subscriber in subscribers {
        subscriber.response(reply.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission_functions::{
        admission_request::GroupVersionKind, admission_response::AdmissionResponse,
        errors::FunctionError,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct Echo;

    impl DecisionFunction for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn decide(
            &self,
            request: &AdmissionRequest,
        ) -> admission_functions::errors::Result<AdmissionResponse> {
            match request.kind.kind.as_str() {
                "Broken" => return Err(FunctionError::DecodePatch("broken".to_string())),
                "Panic" => panic!("cannot handle {}", request.uid),
                _ => {}
            }
            Ok(AdmissionResponse::allow(request.uid.clone()))
        }
    }

    struct Collector(UnboundedSender<InvocationReply>);

    impl ResponseReceiver for Collector {
        fn response(&self, reply: InvocationReply) {
            let _ = self.0.send(reply);
        }
    }

    fn bus() -> InProcessBus {
        let functions: HashMap<String, Arc<dyn DecisionFunction>> =
            HashMap::from([("echo".to_string(), Arc::new(Echo) as Arc<dyn DecisionFunction>)]);
        InProcessBus::start(functions, 8, 4)
    }

    fn payload(uid: &str, kind: &str) -> Vec<u8> {
        serde_json::to_vec(&AdmissionRequest {
            uid: uid.to_string(),
            kind: GroupVersionKind {
                kind: kind.to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reply_is_broadcast_to_every_subscriber() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Collector(tx.clone())));
        bus.subscribe(Arc::new(Collector(tx)));

        bus.invoke("echo", payload("abc", "Pod")).unwrap();

        for _ in 0..2 {
            let reply = rx.recv().await.unwrap();
            assert_eq!(reply.topic, "echo");
            assert_eq!(reply.function, "echo");
            assert_eq!(reply.uid.as_deref(), Some("abc"));
            let ReplyOutcome::Body(body) = reply.outcome else {
                panic!("expected a response body");
            };
            let response: AdmissionResponse = serde_json::from_slice(&body).unwrap();
            assert!(response.allowed);
        }
    }

    #[tokio::test]
    async fn function_failure_is_replied_as_error() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Collector(tx)));

        bus.invoke("echo", payload("abc", "Broken")).unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.uid.as_deref(), Some("abc"));
        assert!(matches!(reply.outcome, ReplyOutcome::Error(msg) if msg.contains("broken")));
    }

    #[tokio::test]
    async fn undecodable_payload_is_replied_as_error() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Collector(tx)));

        bus.invoke("echo", b"not json".to_vec()).unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.uid, None);
        assert!(matches!(reply.outcome, ReplyOutcome::Error(_)));
    }

    #[tokio::test]
    async fn unknown_topic() {
        let bus = bus();

        assert_eq!(
            bus.invoke("nope", payload("abc", "Pod")),
            Err(BusError::UnknownTopic("nope".to_string()))
        );
        assert_eq!(bus.topics(), ["echo".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue() {
        let functions: HashMap<String, Arc<dyn DecisionFunction>> =
            HashMap::from([("echo".to_string(), Arc::new(Echo) as Arc<dyn DecisionFunction>)]);
        let bus = InProcessBus::start(functions, 1, 1);

        // the serving task cannot run before this test yields
        bus.invoke("echo", payload("a", "Pod")).unwrap();
        assert_eq!(bus.invoke("echo", payload("b", "Pod")), Err(BusError::Full));
    }

    #[tokio::test]
    async fn panicking_function_is_replied_as_error() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Collector(tx)));

        bus.invoke("echo", payload("abc", "Panic")).unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.uid.as_deref(), Some("abc"));
        assert!(matches!(reply.outcome, ReplyOutcome::Error(msg) if msg.contains("panicked")));

        // the bus keeps serving after a panic
        bus.invoke("echo", payload("def", "Pod")).unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.uid.as_deref(), Some("def"));
        assert!(matches!(reply.outcome, ReplyOutcome::Body(_)));
    }

    #[derive(Default)]
    struct Slow {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl DecisionFunction for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn decide(
            &self,
            request: &AdmissionRequest,
        ) -> admission_functions::errors::Result<AdmissionResponse> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.running.fetch_sub(1, Ordering::SeqCst);

            Ok(AdmissionResponse::allow(request.uid.clone()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn evaluations_are_bounded_by_workers() {
        let slow = Arc::new(Slow::default());
        let functions: HashMap<String, Arc<dyn DecisionFunction>> =
            HashMap::from([("slow".to_string(), slow.clone() as Arc<dyn DecisionFunction>)]);
        let bus = InProcessBus::start(functions, 8, 2);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Collector(tx)));

        for i in 0..6 {
            bus.invoke("slow", payload(&format!("uid-{i}"), "Pod")).unwrap();
        }
        for _ in 0..6 {
            rx.recv().await.unwrap();
        }

        let peak = slow.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "{peak} evaluations ran at the same time");
    }
}
