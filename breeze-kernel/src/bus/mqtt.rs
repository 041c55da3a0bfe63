use super::{BusError, BusEvent, BusEvents, InboundMessage, MessageBus};
use crate::health::{BusHealth, HealthTracker};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    /// (topic, payload) publié par le broker si la session tombe
    pub last_will: Option<(String, Vec<u8>)>,
}

impl MqttSettings {
    pub fn new(client_id: &str, host: &str, port: u16) -> Self {
        Self {
            client_id: client_id.to_string(),
            host: host.to_string(),
            port,
            keep_alive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, topic: &str, payload: Vec<u8>) -> Self {
        self.last_will = Some((topic.to_string(), payload));
        self
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some((topic, payload)) = &self.last_will {
            opts.set_last_will(LastWill::new(topic, payload.clone(), QoS::AtLeastOnce, false));
        }
        opts
    }
}

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

struct Inner {
    settings: MqttSettings,
    session: Mutex<Option<Session>>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    events: mpsc::UnboundedSender<BusEvent>,
    health: HealthTracker,
}

/// Transport MQTT (rumqttc) : une session par connect(), reconnexion automatique dans le driver
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<Inner>,
}

impl MqttBus {
    pub fn new(settings: MqttSettings) -> (Self, BusEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let bus = Self {
            inner: Arc::new(Inner {
                settings,
                session: Mutex::new(None),
                subscriptions: Arc::new(Mutex::new(BTreeSet::new())),
                events,
                health: HealthTracker::new(),
            }),
        };
        (bus, rx)
    }

    pub fn tracker(&self) -> HealthTracker {
        self.inner.health.clone()
    }

    fn client(&self) -> Result<AsyncClient, BusError> {
        if !self.inner.health.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(BusError::NotConnected)
    }
}

impl MessageBus for MqttBus {
    async fn connect(&self) -> Result<(), BusError> {
        let active = self.inner.session.lock().is_some();
        if active {
            return Ok(());
        }

        let settings = &self.inner.settings;
        info!("[bus] connecting to mqtt://{}:{} as {}", settings.host, settings.port, settings.client_id);
        self.inner.health.mark_connecting();

        let (client, eventloop) = AsyncClient::new(settings.options(), 64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            self.inner.subscriptions.clone(),
            self.inner.events.clone(),
            self.inner.health.clone(),
            settings.retry_delay,
            ready_tx,
        ));

        let handshake = tokio::time::timeout(settings.connect_timeout, ready_rx).await;
        match handshake {
            Ok(Ok(())) => {
                *self.inner.session.lock() = Some(Session { client, driver });
                Ok(())
            }
            Ok(Err(_)) => {
                driver.abort();
                self.inner.health.mark_disconnected();
                Err(BusError::HandshakeAborted)
            }
            Err(_) => {
                driver.abort();
                self.inner.health.mark_disconnected();
                warn!("[bus] no CONNACK from {}:{} within {:?}", settings.host, settings.port, settings.connect_timeout);
                Err(BusError::HandshakeTimeout(settings.connect_timeout.as_secs()))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let session = self.inner.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        self.inner.subscriptions.lock().clear();
        if let Err(e) = session.client.disconnect().await {
            debug!("[bus] disconnect request failed: {}", e);
        }

        let mut driver = session.driver;
        if tokio::time::timeout(Duration::from_secs(2), &mut driver).await.is_err() {
            driver.abort();
        }

        self.inner.health.mark_disconnected();
        let _ = self.inner.events.send(BusEvent::Disconnected);
        info!("[bus] disconnected");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let client = self.client()?;
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.inner.subscriptions.lock().insert(filter.to_string());
        debug!("[bus] subscribed to {}", filter);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.inner.subscriptions.lock().remove(filter);
        let client = self.client()?;
        client
            .unsubscribe(filter)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        let client = self.client()?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.inner.health.record_sent();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.health.is_connected()
    }

    fn health(&self) -> BusHealth {
        self.inner.health.snapshot()
    }
}

/// Boucle de poll rumqttc : CONNACK, publications entrantes, reconnexion après erreur
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    events: mpsc::UnboundedSender<BusEvent>,
    health: HealthTracker,
    retry_delay: Duration,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                health.mark_connected();
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => {
                        let restored = resubscribe(&client, &subscriptions);
                        info!("[bus] reconnected, {} subscription(s) restored", restored.len());
                    }
                }
                let _ = events.send(BusEvent::Connected);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                health.record_received();
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                };
                if events.send(BusEvent::Message(message)).is_err() {
                    debug!("[bus] event receiver dropped, stopping driver");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                link_error(&health, &events, ready.is_none(), &e);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Session propre : après un CONNACK de reconnexion, les abonnements sont à refaire.
/// Renvoie les filtres effectivement remis en file.
fn resubscribe(client: &AsyncClient, subscriptions: &Mutex<BTreeSet<String>>) -> Vec<String> {
    let filters: Vec<String> = subscriptions.lock().iter().cloned().collect();
    filters
        .into_iter()
        .filter(|filter| match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => true,
            Err(e) => {
                error!("[bus] resubscribe to {} failed: {}", filter, e);
                false
            }
        })
        .collect()
}

/// Erreur du transport : Disconnected si le lien était établi, Reconnecting une fois le handshake initial passé
fn link_error(
    health: &HealthTracker,
    events: &mpsc::UnboundedSender<BusEvent>,
    handshake_done: bool,
    error: &impl std::fmt::Display,
) {
    if health.is_connected() {
        warn!("[bus] MQTT connection lost: {}", error);
        let _ = events.send(BusEvent::Disconnected);
    } else {
        debug!("[bus] MQTT error: {}", error);
    }
    if handshake_done {
        health.increment_reconnects();
    }
}
