//! Broker transports.
//!
//! [`Transport`] hides whether frames travel over a real MQTT broker
//! ([`MqttTransport`]) or an in-process hub ([`LocalTransport`]) used by tests
//! and single-process deployments. Publishes and (un)subscribes are
//! non-blocking; connection management and the ingress loop are async.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// An inbound frame as received from the broker.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub payload: String,
}

/// Transport to a publish/subscribe broker. Inbound frames are pushed into
/// the ingress channel handed over at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the connection. Idempotent; returns `false` when the
    /// broker is unreachable.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    /// Runs the ingress loop until cancelled or disconnected.
    async fn main_loop(&self, cancel: CancellationToken);

    fn publish(&self, topic: &str, payload: String, qos: Qos);

    fn subscribe(&self, filter: &str, qos: Qos);

    fn unsubscribe(&self, filter: &str);
}

/// Broker coordinates for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Connect over a Unix domain socket instead of TCP when set.
    pub socket_path: Option<PathBuf>,
    pub client_id: String,
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub fn endpoint(&self) -> String {
        match &self.socket_path {
            Some(path) => path.display().to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// MQTT transport backed by rumqttc.
///
/// Publishes issued before the connection is up are buffered and flushed once
/// the broker acknowledges the session; subscriptions are replayed on every
/// (re)connect.
pub struct MqttTransport {
    config: BrokerConfig,
    ingress: UnboundedSender<Frame>,
    client: Mutex<Option<AsyncClient>>,
    event_loop: tokio::sync::Mutex<Option<rumqttc::EventLoop>>,
    connected: AtomicBool,
    filters: Mutex<BTreeMap<String, Qos>>,
    pending: Mutex<Vec<(String, String, Qos)>>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig, ingress: UnboundedSender<Frame>) -> Self {
        Self {
            config,
            ingress,
            client: Mutex::new(None),
            event_loop: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            filters: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = match &self.config.socket_path {
            Some(path) => {
                let mut options =
                    MqttOptions::new(&self.config.client_id, path.display().to_string(), 0);
                options.set_transport(rumqttc::Transport::Unix);
                options
            }
            None => MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port),
        };
        options.set_keep_alive(Duration::from_secs(30));
        options
    }

    fn flush_after_connect(&self, client: &AsyncClient) {
        let filters: Vec<(String, Qos)> = self
            .filters
            .lock()
            .expect("filter table poisoned")
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        for (filter, qos) in filters {
            if let Err(e) = client.try_subscribe(&filter, qos.into()) {
                warn!(filter = %filter, error = %e, "subscribe after connect failed");
            }
        }
        let pending: Vec<_> = self
            .pending
            .lock()
            .expect("pending publish buffer poisoned")
            .drain(..)
            .collect();
        for (topic, payload, qos) in pending {
            if let Err(e) = client.try_publish(&topic, qos.into(), false, payload) {
                warn!(topic = %topic, error = %e, "buffered publish failed");
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        let (client, mut event_loop) = AsyncClient::new(self.options(), 256);
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            match tokio::time::timeout_at(deadline, event_loop.poll()).await {
                Err(_) => {
                    warn!(endpoint = %self.config.endpoint(), "broker connect timed out");
                    return false;
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!(endpoint = %self.config.endpoint(), error = %e, "broker connect failed");
                    return false;
                }
            }
        }
        debug!(endpoint = %self.config.endpoint(), "connected to broker");
        *self.client.lock().expect("client slot poisoned") = Some(client.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.flush_after_connect(&client);
        *self.event_loop.lock().await = Some(event_loop);
        true
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let client = self.client.lock().expect("client slot poisoned").take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
    }

    async fn main_loop(&self, cancel: CancellationToken) {
        let mut event_loop = match self.event_loop.lock().await.take() {
            Some(event_loop) => event_loop,
            None => return,
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = Frame {
                            topic: publish.topic.clone(),
                            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        };
                        if self.ingress.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // session re-established; replay subscriptions
                        self.connected.store(true, Ordering::SeqCst);
                        let client = self.client.lock().expect("client slot poisoned").clone();
                        if let Some(client) = client {
                            self.flush_after_connect(&client);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !self.connected.swap(false, Ordering::SeqCst) {
                            // already reported; back off while rumqttc reconnects
                        } else {
                            warn!(error = %e, "broker connection lost, retrying");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn publish(&self, topic: &str, payload: String, qos: Qos) {
        if !self.connected.load(Ordering::SeqCst) {
            self.pending
                .lock()
                .expect("pending publish buffer poisoned")
                .push((topic.to_string(), payload, qos));
            return;
        }
        let client = self.client.lock().expect("client slot poisoned").clone();
        match client {
            Some(client) => {
                if let Err(e) = client.try_publish(topic, qos.into(), false, payload) {
                    warn!(topic, error = %e, "publish failed");
                }
            }
            None => warn!(topic, "publish dropped: no broker client"),
        }
    }

    fn subscribe(&self, filter: &str, qos: Qos) {
        self.filters
            .lock()
            .expect("filter table poisoned")
            .insert(filter.to_string(), qos);
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let client = self.client.lock().expect("client slot poisoned").clone();
        if let Some(client) = client {
            if let Err(e) = client.try_subscribe(filter, qos.into()) {
                warn!(filter, error = %e, "subscribe failed");
            }
        }
    }

    fn unsubscribe(&self, filter: &str) {
        self.filters
            .lock()
            .expect("filter table poisoned")
            .remove(filter);
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let client = self.client.lock().expect("client slot poisoned").clone();
        if let Some(client) = client {
            if let Err(e) = client.try_unsubscribe(filter) {
                warn!(filter, error = %e, "unsubscribe failed");
            }
        }
    }
}

struct Peer {
    id: u64,
    filters: BTreeMap<String, usize>,
    sender: UnboundedSender<Frame>,
}

#[derive(Default)]
struct HubInner {
    peers: Mutex<Vec<Peer>>,
    next_id: AtomicU64,
}

/// In-process broker hub. Every attached [`LocalTransport`] sees each publish
/// that matches one of its subscriptions, the publisher included, in
/// publication order.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, ingress: UnboundedSender<Frame>) -> LocalTransport {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.peers.lock().expect("peer table poisoned").push(Peer {
            id,
            filters: BTreeMap::new(),
            sender: ingress,
        });
        LocalTransport {
            hub: self.clone(),
            peer_id: id,
        }
    }

    fn publish(&self, topic: &str, payload: String) {
        let peers = self.inner.peers.lock().expect("peer table poisoned");
        for peer in peers.iter() {
            if peer
                .filters
                .keys()
                .any(|filter| volt_topics::matches(topic, filter))
            {
                let _ = peer.sender.send(Frame {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// One endpoint on a [`LocalHub`].
pub struct LocalTransport {
    hub: LocalHub,
    peer_id: u64,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {
        let mut peers = self.hub.inner.peers.lock().expect("peer table poisoned");
        peers.retain(|peer| peer.id != self.peer_id);
    }

    async fn main_loop(&self, cancel: CancellationToken) {
        // frames are delivered directly by publishers
        cancel.cancelled().await;
    }

    fn publish(&self, topic: &str, payload: String, _qos: Qos) {
        self.hub.publish(topic, payload);
    }

    fn subscribe(&self, filter: &str, _qos: Qos) {
        let mut peers = self.hub.inner.peers.lock().expect("peer table poisoned");
        if let Some(peer) = peers.iter_mut().find(|peer| peer.id == self.peer_id) {
            *peer.filters.entry(filter.to_string()).or_insert(0) += 1;
        }
    }

    fn unsubscribe(&self, filter: &str) {
        let mut peers = self.hub.inner.peers.lock().expect("peer table poisoned");
        if let Some(peer) = peers.iter_mut().find(|peer| peer.id == self.peer_id) {
            if let Some(count) = peer.filters.get_mut(filter) {
                *count -= 1;
                if *count == 0 {
                    peer.filters.remove(filter);
                }
            }
        }
    }
}
