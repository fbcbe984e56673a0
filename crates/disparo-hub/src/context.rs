use crate::gateway::{GatewayError, SessionGateway};
use crate::pipeline::{self, BatchJob, DelayPolicy, Pacer};
use chrono::Utc;
use disparo_core::delay::DelayConfig;
use disparo_core::events::{
    DisconnectedPayload, DispatchEvent, MessageSessionPayload, QrCodePayload, ReadyPayload,
};
use disparo_core::history::HistoryRing;
use disparo_core::session::{GatewayEvent, SessionSnapshot, SessionState};
use disparo_core::{BatchSession, ContactRecord};
use serde::Serialize;
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, PoisonError, RwLock as StdRwLock,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError, RwLock};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 1024;
const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue is full; retry after a queued batch completes")]
    Busy,
    #[error("dispatch queue is closed")]
    QueueClosed,
}

/// Shared, replaceable pacing configuration.
#[derive(Clone, Debug, Default)]
pub struct DelayHandle(Arc<StdRwLock<DelayConfig>>);

impl DelayHandle {
    pub fn new(config: DelayConfig) -> Self {
        Self(Arc::new(StdRwLock::new(config)))
    }

    pub fn get(&self) -> DelayConfig {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, config: DelayConfig) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

#[derive(Clone, Debug)]
pub struct ObserverConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ContextConfig {
    pub delay: DelayConfig,
    pub auth_dir: PathBuf,
    pub observer: ObserverConfig,
    /// Overrides the randomized delay policy.
    pub pacer: Option<Arc<dyn Pacer>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchAck {
    pub session_id: String,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Application state shared by the HTTP layer, the observer channel and the
/// dispatch worker.
pub struct AppContext {
    gateway: Arc<dyn SessionGateway>,
    pacer: Arc<dyn Pacer>,
    session: RwLock<SessionState>,
    delay: DelayHandle,
    history: RwLock<HistoryRing>,
    events: broadcast::Sender<DispatchEvent>,
    queue: mpsc::Sender<BatchJob>,
    last_batch_id: AtomicI64,
    observer_counter: AtomicU64,
    auth_dir: PathBuf,
    observer: ObserverConfig,
}

impl AppContext {
    /// Build the context and spawn its session tracker and dispatch worker.
    pub fn start(config: ContextConfig, gateway: Arc<dyn SessionGateway>) -> Arc<Self> {
        let (queue, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let delay = DelayHandle::new(config.delay);
        let pacer: Arc<dyn Pacer> = match config.pacer {
            Some(pacer) => pacer,
            None => Arc::new(DelayPolicy::new(delay.clone())),
        };
        let gateway_events = gateway.subscribe();
        let ctx = Arc::new(Self {
            gateway,
            pacer,
            session: RwLock::new(SessionState::default()),
            delay,
            history: RwLock::new(HistoryRing::default()),
            events,
            queue,
            last_batch_id: AtomicI64::new(0),
            observer_counter: AtomicU64::new(0),
            auth_dir: config.auth_dir,
            observer: config.observer,
        });
        tokio::spawn(track_session(ctx.clone(), gateway_events));
        tokio::spawn(pipeline::run_worker(ctx.clone(), queue_rx));
        ctx
    }

    pub fn gateway(&self) -> &dyn SessionGateway {
        self.gateway.as_ref()
    }

    pub fn pacer(&self) -> &dyn Pacer {
        self.pacer.as_ref()
    }

    pub fn observer_config(&self) -> &ObserverConfig {
        &self.observer
    }

    pub fn next_observer_id(&self) -> String {
        let id = self.observer_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("obs-{id}")
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: DispatchEvent) {
        debug!(event = "publish", kind = event.name(), session_id = ?event.session_id());
        let _ = self.events.send(event);
    }

    pub async fn session_state(&self) -> SessionState {
        self.session.read().await.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.read().await.snapshot()
    }

    /// Ready means both our state copy and the gateway agree the session is open.
    pub async fn is_ready(&self) -> bool {
        self.session.read().await.is_connected() && self.gateway.is_ready()
    }

    pub fn delay_config(&self) -> DelayConfig {
        self.delay.get()
    }

    pub fn replace_delay(&self, config: DelayConfig) {
        info!(
            event = "delay_configured",
            base_seconds = config.base_seconds,
            variation_seconds = config.variation_seconds
        );
        self.delay.replace(config);
    }

    pub async fn history(&self) -> Vec<BatchSession> {
        self.history.read().await.to_vec()
    }

    /// Resolved contact records of a finished batch still in history.
    pub async fn batch_contacts(&self, session_id: &str) -> Option<Vec<ContactRecord>> {
        self.history
            .read()
            .await
            .get(session_id)
            .map(|session| session.contacts.clone())
    }

    pub async fn record_history(&self, session: BatchSession) {
        let mut history = self.history.write().await;
        if let Some(evicted) = history.record(session) {
            debug!(event = "history_evicted", session_id = %evicted.id);
        }
    }

    /// Millisecond timestamps, forced strictly increasing so ids stay unique.
    pub fn next_batch_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_batch_id.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_batch_id.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next.to_string(),
                Err(actual) => last = actual,
            }
        }
    }

    /// Queue a loaded batch and announce it to observers. Never waits for
    /// room: a full queue is [`DispatchError::Busy`].
    pub async fn accept_batch(
        &self,
        file_name: String,
        contacts: Vec<ContactRecord>,
    ) -> Result<BatchAck, DispatchError> {
        let permit = self.queue.try_reserve().map_err(|err| match err {
            TrySendError::Full(()) => {
                warn!(event = "batch_rejected_busy", file_name = %file_name);
                DispatchError::Busy
            }
            TrySendError::Closed(()) => DispatchError::QueueClosed,
        })?;
        let session = BatchSession::new(
            self.next_batch_id(),
            file_name,
            contacts.len(),
            Utc::now(),
        );
        let ack = BatchAck {
            session_id: session.id.clone(),
            total: contacts.len(),
            sent: 0,
            failed: 0,
        };
        self.publish(DispatchEvent::MessageSession(MessageSessionPayload {
            session_id: session.id.clone(),
            contacts: contacts.clone(),
            total: contacts.len(),
        }));
        info!(
            event = "batch_accepted",
            session_id = %session.id,
            file_name = %session.file_name,
            total = session.total_contacts
        );
        permit.send(BatchJob { session, contacts });
        Ok(ack)
    }

    pub async fn restart(&self, keep_credentials: bool) -> Result<(), GatewayError> {
        self.session.write().await.begin_restart(keep_credentials);
        self.gateway.restart(keep_credentials).await
    }

    /// Drop persisted credentials, then restart the gateway without them.
    pub async fn clean_session(&self) -> Result<(), GatewayError> {
        match tokio::fs::remove_dir_all(&self.auth_dir).await {
            Ok(()) => info!(event = "auth_state_removed", dir = %self.auth_dir.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(event = "auth_state_remove_failed", dir = %self.auth_dir.display(), error = %err)
            }
        }
        self.restart(false).await
    }

    /// Events that bring a fresh observer up to date with the session.
    pub async fn greeting(&self) -> Vec<DispatchEvent> {
        let state = self.session.read().await;
        let mut events = Vec::new();
        if state.is_connected() {
            events.push(DispatchEvent::WhatsappReady(ReadyPayload { connected: true }));
        } else if let Some(qr) = &state.last_qr {
            events.push(DispatchEvent::QrCode(QrCodePayload { qr: qr.clone() }));
        }
        events
    }

    pub(crate) async fn apply_gateway_event(&self, event: GatewayEvent) {
        self.session.write().await.apply(&event);
        let published = match event {
            GatewayEvent::Qr(qr) => {
                info!(event = "session_qr");
                DispatchEvent::QrCode(QrCodePayload { qr })
            }
            GatewayEvent::Ready(identity) => {
                info!(
                    event = "session_ready",
                    address = identity.as_ref().map(|id| id.address.as_str()).unwrap_or("")
                );
                DispatchEvent::WhatsappReady(ReadyPayload { connected: true })
            }
            GatewayEvent::Disconnected { reason, logged_out } => {
                warn!(event = "session_disconnected", reason = %reason, logged_out = logged_out);
                DispatchEvent::WhatsappDisconnected(DisconnectedPayload { reason })
            }
        };
        self.publish(published);
    }
}

async fn track_session(ctx: Arc<AppContext>, mut events: broadcast::Receiver<GatewayEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => ctx.apply_gateway_event(event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "session_events_lagged", skipped = skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(event = "session_tracker_stop");
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[tokio::test]
    async fn readiness_requires_state_and_gateway() {
        let h = harness();
        assert!(!h.ctx.is_ready().await);
        h.gateway.set_ready(true);
        assert!(!h.ctx.is_ready().await);
        h.ctx.apply_gateway_event(GatewayEvent::Ready(None)).await;
        assert!(h.ctx.is_ready().await);
        h.gateway.set_ready(false);
        assert!(!h.ctx.is_ready().await);
    }

    #[tokio::test]
    async fn batch_ids_are_unique_and_increasing() {
        let h = harness();
        let ids: Vec<i64> = (0..100)
            .map(|_| h.ctx.next_batch_id().parse().expect("numeric id"))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[tokio::test]
    async fn gateway_events_update_state_and_reach_observers() {
        let h = harness();
        let mut observer = h.ctx.subscribe_events();
        h.ctx
            .apply_gateway_event(GatewayEvent::Qr("qr-data".to_string()))
            .await;
        assert!(h.ctx.snapshot().await.has_pending_qr);
        assert_eq!(
            observer.recv().await.expect("event"),
            DispatchEvent::QrCode(QrCodePayload {
                qr: "qr-data".to_string()
            })
        );
        assert_eq!(
            h.ctx.greeting().await,
            vec![DispatchEvent::QrCode(QrCodePayload {
                qr: "qr-data".to_string()
            })]
        );

        h.ctx
            .apply_gateway_event(GatewayEvent::Disconnected {
                reason: "515".to_string(),
                logged_out: false,
            })
            .await;
        assert_eq!(
            observer.recv().await.expect("event"),
            DispatchEvent::WhatsappDisconnected(DisconnectedPayload {
                reason: "515".to_string()
            })
        );
    }

    #[tokio::test]
    async fn tracker_follows_gateway_stream() {
        let h = harness();
        let mut observer = h.ctx.subscribe_events();
        h.gateway.emit(GatewayEvent::Ready(None));
        let event = tokio::time::timeout(Duration::from_secs(2), observer.recv())
            .await
            .expect("timely event")
            .expect("event");
        assert_eq!(
            event,
            DispatchEvent::WhatsappReady(ReadyPayload { connected: true })
        );
        assert!(h.ctx.snapshot().await.connected);
    }

    #[tokio::test]
    async fn clean_session_removes_auth_dir_and_restarts_without_credentials() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("disparo-auth-test-{nanos}"));
        std::fs::create_dir_all(dir.join("keys")).expect("create auth dir");
        std::fs::write(dir.join("creds.json"), "{}").expect("write creds");

        let h = harness_with_auth_dir(dir.clone());
        h.connect().await;
        h.ctx.clean_session().await.expect("clean session");

        assert!(!dir.exists());
        assert_eq!(h.gateway.restarts(), vec![false]);
        assert!(!h.ctx.is_ready().await);
    }

    #[tokio::test]
    async fn restart_keeps_credentials_and_tolerates_missing_dir() {
        let h = harness();
        h.connect().await;
        h.ctx.restart(true).await.expect("restart");
        h.ctx.clean_session().await.expect("missing dir is fine");
        assert_eq!(h.gateway.restarts(), vec![true, false]);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let h = harness();
        let contact = ContactRecord::new(1, Some("Ana".to_string()), "11987654321", "Oi");
        // no await point yields to the worker, so nothing is drained meanwhile
        for n in 0..QUEUE_CAPACITY {
            h.ctx
                .accept_batch(format!("lote-{n}.csv"), vec![contact.clone()])
                .await
                .expect("room in queue");
        }
        let mut observer = h.ctx.subscribe_events();
        let refused = h
            .ctx
            .accept_batch("lote-extra.csv".to_string(), vec![contact])
            .await;
        assert!(matches!(refused, Err(DispatchError::Busy)));
        assert!(observer.try_recv().is_err());
    }

    #[test]
    fn delay_handle_replaces_config() {
        let handle = DelayHandle::new(DelayConfig::from_base(3.0));
        handle.replace(DelayConfig::from_base(10.0));
        assert_eq!(handle.get().base_seconds, 10.0);
        assert_eq!(handle.get().variation_seconds, 3.0);
    }
}
