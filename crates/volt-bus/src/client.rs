//! The broker client: subscription table, ingress queue and dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::{Handler, StopMode, SubscriptionQueue};
use crate::transport::{BrokerConfig, Frame, LocalHub, MqttTransport, Qos, Transport};

/// Opaque handle for one registered handler. Returned by
/// [`BrokerClient::register_handler`], consumed by
/// [`BrokerClient::unregister_handler`].
#[derive(Debug)]
pub struct SubscriptionToken {
    id: u64,
    filter: String,
}

impl SubscriptionToken {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Snapshot of the client's traffic counters.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub received: u64,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub protocol_errors: u64,
}

/// Topic-addressed publish/subscribe client.
///
/// Owns the transport, the subscription table and the dispatch task. Inbound
/// frames are decoded (JSON below the internal prefix, wrapped strings
/// elsewhere) and fanned into the per-subscription queues; malformed frames
/// are counted and dropped, never fatal.
pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    internal_prefix: String,
    stop_mode: StopMode,
    subscriptions: Arc<RwLock<HashMap<String, Arc<SubscriptionQueue>>>>,
    ingress: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    next_token: AtomicU64,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Client talking to a real MQTT broker.
    pub fn over_mqtt(
        config: BrokerConfig,
        internal_prefix: &str,
        stop_mode: StopMode,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MqttTransport::new(config, tx));
        Self::with_transport(transport, rx, internal_prefix, stop_mode)
    }

    /// Client attached to an in-process hub.
    pub fn local(hub: &LocalHub, internal_prefix: &str, stop_mode: StopMode) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(hub.attach(tx));
        Self::with_transport(transport, rx, internal_prefix, stop_mode)
    }

    fn with_transport(
        transport: Arc<dyn Transport>,
        ingress: mpsc::UnboundedReceiver<Frame>,
        internal_prefix: &str,
        stop_mode: StopMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            internal_prefix: internal_prefix.trim_end_matches('/').to_string(),
            stop_mode,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            ingress: Mutex::new(Some(ingress)),
            next_token: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connects the transport. Idempotent; `false` when the broker is
    /// unreachable.
    pub async fn connect(&self) -> bool {
        self.transport.connect().await
    }

    /// Drops the broker connection without stopping the workers. Use
    /// [`BrokerClient::stop`] for a full teardown.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Starts the transport ingress task and the dispatch task.
    pub fn spawn_main_loop(&self) {
        let mut ingress = match self.ingress.lock().expect("ingress slot poisoned").take() {
            Some(rx) => rx,
            None => return,
        };

        let transport = self.transport.clone();
        let transport_cancel = self.cancel.clone();
        let transport_task =
            tokio::spawn(async move { transport.main_loop(transport_cancel).await });

        let subscriptions = self.subscriptions.clone();
        let counters = self.counters.clone();
        let internal_prefix = self.internal_prefix.clone();
        let cancel = self.cancel.clone();
        let stop_mode = self.stop_mode;
        let dispatch_task = tokio::spawn(async move {
            loop {
                // biased so queued frames win over cancellation; on stop in
                // drain mode the backlog is flushed before exiting
                tokio::select! {
                    biased;
                    frame = ingress.recv() => match frame {
                        Some(frame) => {
                            dispatch(&subscriptions, &counters, &internal_prefix, frame).await
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        if stop_mode == StopMode::Drain {
                            while let Ok(frame) = ingress.try_recv() {
                                dispatch(&subscriptions, &counters, &internal_prefix, frame).await;
                            }
                        }
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(transport_task);
        tasks.push(dispatch_task);
    }

    /// Registers a handler for a topic filter (MQTT wildcards allowed).
    /// Handlers on the same filter run in registration order; the first
    /// handler of a filter subscribes it on the broker.
    pub fn register_handler(&self, filter: &str, handler: Handler, qos: Qos) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut is_new = false;
        {
            let mut subscriptions =
                self.subscriptions.write().expect("subscription table poisoned");
            let queue = subscriptions.entry(filter.to_string()).or_insert_with(|| {
                is_new = true;
                Arc::new(SubscriptionQueue::new())
            });
            queue.add_handler(token, handler);
        }
        if is_new {
            self.transport.subscribe(filter, qos);
        }
        debug!(filter, token, "handler registered");
        SubscriptionToken {
            id: token,
            filter: filter.to_string(),
        }
    }

    /// Removes a handler; the last handler of a filter unsubscribes it.
    pub fn unregister_handler(&self, token: SubscriptionToken) {
        let mut unsubscribe = false;
        {
            let mut subscriptions =
                self.subscriptions.write().expect("subscription table poisoned");
            if let Some(queue) = subscriptions.get(&token.filter) {
                if queue.remove_handler(token.id) == 0 {
                    subscriptions.remove(&token.filter);
                    unsubscribe = true;
                }
            }
        }
        if unsubscribe {
            self.transport.unsubscribe(&token.filter);
        }
        debug!(filter = %token.filter, token = token.id, "handler unregistered");
    }

    /// Publishes a JSON payload. Fire-and-forget.
    pub fn publish(&self, topic: &str, payload: &Value, qos: Qos) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.transport.publish(topic, payload.to_string(), qos);
    }

    /// Publishes a raw string payload, for external-prefix topics.
    pub fn publish_raw(&self, topic: &str, payload: String, qos: Qos) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.transport.publish(topic, payload, qos);
    }

    pub fn internal_prefix(&self) -> &str {
        &self.internal_prefix
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            received: self.counters.received.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            protocol_errors: self.counters.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Disconnects and stops all workers. Pending messages are drained or
    /// dropped according to the stop mode chosen at construction; pending
    /// RPC calls observe shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();

        // wait for the dispatch and transport tasks first, so no frame is in
        // flight when the subscription queues wind down
        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task list poisoned").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let queues: Vec<Arc<SubscriptionQueue>> = {
            let mut subscriptions =
                self.subscriptions.write().expect("subscription table poisoned");
            subscriptions.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.stop(self.stop_mode).await;
        }

        self.transport.disconnect().await;
    }
}

/// Decodes one inbound frame and fans it into every matching subscription
/// queue. Payloads below the internal prefix must be JSON; anything else is
/// wrapped as a JSON string.
async fn dispatch(
    subscriptions: &RwLock<HashMap<String, Arc<SubscriptionQueue>>>,
    counters: &Counters,
    internal_prefix: &str,
    frame: Frame,
) {
    counters.received.fetch_add(1, Ordering::Relaxed);

    let is_internal = internal_prefix.is_empty()
        || frame.topic == internal_prefix
        || frame.topic.starts_with(&format!("{internal_prefix}/"));
    let payload = if is_internal {
        match serde_json::from_str::<Value>(&frame.payload) {
            Ok(value) => value,
            Err(e) => {
                counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %frame.topic, error = %e, "dropping undecodable message");
                return;
            }
        }
    } else {
        Value::String(frame.payload)
    };

    let matching: Vec<Arc<SubscriptionQueue>> = {
        let subscriptions = subscriptions.read().expect("subscription table poisoned");
        subscriptions
            .iter()
            .filter(|(filter, _)| volt_topics::matches(&frame.topic, filter))
            .map(|(_, queue)| queue.clone())
            .collect()
    };

    if matching.is_empty() {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %frame.topic, "no handler for message");
        return;
    }

    let topic: Arc<str> = Arc::from(frame.topic.as_str());
    let payload = Arc::new(payload);
    for queue in matching {
        if queue.deliver(topic.clone(), payload.clone()).await {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
