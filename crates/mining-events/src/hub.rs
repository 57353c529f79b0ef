//! Fan-out of miner events to any number of subscribers.
//!
//! The subscriber set is owned by a single loop task; every mutation
//! (register, unregister, filter change, ping) reaches it as a message.
//! Producers only ever `try_send` into a bounded queue, so a broadcast never
//! waits on a slow consumer.

use crate::event::Event;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_BROADCAST_BUFFER: usize = 256;
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Snapshot callback used for the initial `state.sync` of each subscriber
pub type StateProvider = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("connection limit reached ({max})")]
    ConnectionLimit { max: usize },

    #[error("event hub is not running")]
    NotRunning,

    #[error("event hub is closed")]
    Closed,
}

/// Hub sizing
#[derive(Debug, Clone)]
pub struct EventHubConfig {
    /// Maximum concurrent subscribers; zero or negative selects the default
    pub max_connections: i64,
    pub broadcast_buffer: usize,
    pub client_buffer: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        EventHubConfig {
            max_connections: DEFAULT_MAX_CONNECTIONS as i64,
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }
}

impl EventHubConfig {
    pub fn effective_max_connections(&self) -> usize {
        if self.max_connections <= 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_connections as usize
        }
    }
}

enum Control {
    Register {
        reply: oneshot::Sender<Result<Subscription, HubError>>,
    },
    Unregister {
        id: Uuid,
    },
    Filter {
        id: Uuid,
        miners: Vec<String>,
    },
    Ping {
        id: Uuid,
    },
    SetStateProvider(StateProvider),
}

struct HubReceivers {
    events: mpsc::Receiver<Event>,
    control: mpsc::UnboundedReceiver<Control>,
}

struct HubShared {
    events_tx: mpsc::Sender<Event>,
    control_tx: mpsc::UnboundedSender<Control>,
    /// Taken exactly once when the loop starts
    receivers: Mutex<Option<HubReceivers>>,
    client_count: AtomicUsize,
    dropped: AtomicU64,
    max_connections: usize,
    client_buffer: usize,
    shutdown: CancellationToken,
}

/// Cloneable handle to the event hub
#[derive(Clone)]
pub struct EventHub {
    shared: Arc<HubShared>,
}

struct Client {
    sender: mpsc::Sender<Arc<Event>>,
    /// `None` means every miner
    miners: Option<HashSet<String>>,
}

impl Client {
    fn wants(&self, event: &Event) -> bool {
        if event.event_type.bypasses_filter() {
            return true;
        }
        match (&self.miners, event.miner_name()) {
            (None, _) | (_, None) => true,
            (Some(miners), Some(name)) => miners.contains(name),
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_config(EventHubConfig::default())
    }

    pub fn with_max_connections(max_connections: i64) -> Self {
        Self::with_config(EventHubConfig {
            max_connections,
            ..Default::default()
        })
    }

    pub fn with_config(config: EventHubConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.broadcast_buffer.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        EventHub {
            shared: Arc::new(HubShared {
                events_tx,
                control_tx,
                receivers: Mutex::new(Some(HubReceivers {
                    events: events_rx,
                    control: control_rx,
                })),
                client_count: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
                max_connections: config.effective_max_connections(),
                client_buffer: config.client_buffer.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Start the hub loop on the runtime
    pub fn spawn(&self) -> JoinHandle<()> {
        let receivers = self.shared.receivers.lock().take();
        let hub = self.clone();
        tokio::spawn(async move {
            match receivers {
                Some(receivers) => hub.event_loop(receivers).await,
                None => warn!("Event hub loop already started"),
            }
        })
    }

    /// Run the hub loop on the current task until [`EventHub::stop`]
    pub async fn run(&self) {
        let receivers = self.shared.receivers.lock().take();
        match receivers {
            Some(receivers) => self.event_loop(receivers).await,
            None => warn!("Event hub loop already started"),
        }
    }

    /// Stop the loop and close every subscriber. Safe to call repeatedly,
    /// and before the loop was ever started.
    pub fn stop(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        // never started: make later connects fail fast
        drop(self.shared.receivers.lock().take());
        info!("Event hub stopping");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Queue an event for every interested subscriber without blocking.
    /// A full queue drops the event and bumps the drop counter.
    pub fn broadcast(&self, event: Event) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        match self.shared.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Event queue full, dropping {} event",
                    event.event_type.as_str()
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Register the snapshot used for the initial `state.sync`.
    /// The callback runs once per newly connected subscriber.
    pub fn set_state_provider<F>(&self, provider: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let _ = self
            .shared
            .control_tx
            .send(Control::SetStateProvider(Arc::new(provider)));
    }

    /// Register a new subscriber
    pub async fn connect(&self) -> Result<Subscription, HubError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        if self.shared.receivers.lock().is_some() {
            return Err(HubError::NotRunning);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .control_tx
            .send(Control::Register { reply: reply_tx })
            .map_err(|_| HubError::Closed)?;

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| HubError::Closed)?,
            _ = self.shared.shutdown.cancelled() => Err(HubError::Closed),
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Relaxed)
    }

    /// Events dropped because a queue was full
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    async fn event_loop(&self, mut receivers: HubReceivers) {
        info!(
            "Event hub started (max connections: {})",
            self.shared.max_connections
        );

        let mut clients: HashMap<Uuid, Client> = HashMap::new();
        let mut state_provider: Option<StateProvider> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break,
                Some(control) = receivers.control.recv() => {
                    self.handle_control(control, &mut clients, &mut state_provider);
                }
                Some(event) = receivers.events.recv() => {
                    self.dispatch(event, &mut clients);
                }
                else => break,
            }
        }

        let count = clients.len();
        clients.clear();
        self.shared.client_count.store(0, Ordering::Relaxed);
        info!("Event hub stopped, closed {} subscribers", count);
    }

    fn handle_control(
        &self,
        control: Control,
        clients: &mut HashMap<Uuid, Client>,
        state_provider: &mut Option<StateProvider>,
    ) {
        match control {
            Control::Register { reply } => {
                if clients.len() >= self.shared.max_connections {
                    warn!(
                        "Rejecting subscriber: connection limit {} reached",
                        self.shared.max_connections
                    );
                    let _ = reply.send(Err(HubError::ConnectionLimit {
                        max: self.shared.max_connections,
                    }));
                    return;
                }

                let id = Uuid::new_v4();
                let (sender, receiver) = mpsc::channel(self.shared.client_buffer);

                // state.sync is queued before the client can see any broadcast
                if let Some(provider) = state_provider.as_ref() {
                    let _ = sender.try_send(Arc::new(Event::state_sync(provider())));
                }

                let subscription = Subscription {
                    events: EventReceiver { receiver },
                    handle: SubscriberHandle {
                        id,
                        control_tx: self.shared.control_tx.clone(),
                    },
                };

                if reply.send(Ok(subscription)).is_ok() {
                    clients.insert(
                        id,
                        Client {
                            sender,
                            miners: None,
                        },
                    );
                    self.shared
                        .client_count
                        .store(clients.len(), Ordering::Relaxed);
                    info!("Subscriber {} connected (total: {})", id, clients.len());
                }
            }
            Control::Unregister { id } => {
                if clients.remove(&id).is_some() {
                    self.shared
                        .client_count
                        .store(clients.len(), Ordering::Relaxed);
                    info!("Subscriber {} disconnected (total: {})", id, clients.len());
                }
            }
            Control::Filter { id, miners } => {
                if let Some(client) = clients.get_mut(&id) {
                    client.miners = miner_filter(miners);
                    debug!("Subscriber {} updated miner filter", id);
                }
            }
            Control::Ping { id } => {
                if let Some(client) = clients.get(&id) {
                    if client.sender.try_send(Arc::new(Event::pong())).is_err() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Control::SetStateProvider(provider) => {
                *state_provider = Some(provider);
            }
        }
    }

    fn dispatch(&self, event: Event, clients: &mut HashMap<Uuid, Client>) {
        let event = Arc::new(event);
        let mut closed = Vec::new();

        for (id, client) in clients.iter() {
            if !client.wants(&event) {
                continue;
            }
            match client.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Subscriber {} is lagging, dropped {} event",
                        id,
                        event.event_type.as_str()
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        if !closed.is_empty() {
            for id in closed {
                clients.remove(&id);
            }
            self.shared
                .client_count
                .store(clients.len(), Ordering::Relaxed);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

fn miner_filter(miners: Vec<String>) -> Option<HashSet<String>> {
    if miners.is_empty() || miners.iter().any(|m| m == "*") {
        None
    } else {
        Some(miners.into_iter().collect())
    }
}

/// Receiving half of a subscription
pub struct EventReceiver {
    receiver: mpsc::Receiver<Arc<Event>>,
}

impl EventReceiver {
    /// Next event; `None` once the hub has closed this subscriber
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }
}

/// Control half of a subscription. Dropping it unregisters the subscriber.
pub struct SubscriberHandle {
    id: Uuid,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Restrict miner-scoped events to `miners`; empty or `*` means all
    pub fn subscribe(&self, miners: Vec<String>) {
        let _ = self.control_tx.send(Control::Filter { id: self.id, miners });
    }

    /// Ask the hub for a `pong` addressed to this subscriber only
    pub fn ping(&self) {
        let _ = self.control_tx.send(Control::Ping { id: self.id });
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Unregister { id: self.id });
    }
}

/// A registered subscriber
pub struct Subscription {
    events: EventReceiver,
    handle: SubscriberHandle,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.events.try_recv()
    }

    pub fn subscribe(&self, miners: Vec<String>) {
        self.handle.subscribe(miners);
    }

    pub fn ping(&self) {
        self.handle.ping();
    }

    pub fn into_parts(self) -> (EventReceiver, SubscriberHandle) {
        (self.events, self.handle)
    }
}
