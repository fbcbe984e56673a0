use async_trait::async_trait;
use disparo_core::bridge_ipc::{
    decode_frame, encode_frame, BridgeEnvelope, BridgeMsg, RestartPayload, SendPayload,
};
use disparo_core::phone::RecipientAddress;
use disparo_core::session::GatewayEvent;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const EVENT_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("session is not connected")]
    NotConnected,
    #[error("bridge did not answer within {0:?}")]
    Timeout(Duration),
    #[error("bridge rejected the message: {0}")]
    Rejected(String),
    #[error("bridge link closed")]
    Closed,
}

/// The chat-protocol session as seen by the dispatcher.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Whether the gateway has ever established its underlying link.
    fn is_initialized(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    async fn send(&self, recipient: &RecipientAddress, text: &str) -> Result<(), GatewayError>;

    async fn restart(&self, keep_credentials: bool) -> Result<(), GatewayError>;
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub url: Url,
    pub send_timeout: Duration,
}

type PendingSend = oneshot::Sender<Result<(), GatewayError>>;

/// A frame bound to the link generation it was queued for.
struct OutboundFrame {
    generation: u64,
    request_id: Option<String>,
    text: String,
}

/// Session gateway backed by an external bridge process reached over a WebSocket.
pub struct BridgeGateway {
    config: BridgeConfig,
    link_up: AtomicBool,
    initialized: AtomicBool,
    session_open: AtomicBool,
    link_generation: AtomicU64,
    request_counter: AtomicU64,
    pending: Mutex<HashMap<String, PendingSend>>,
    outbound: mpsc::Sender<OutboundFrame>,
    events: broadcast::Sender<GatewayEvent>,
}

impl BridgeGateway {
    pub fn spawn(config: BridgeConfig, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let (gateway, outbound_rx) = Self::new(config);
        tokio::spawn(gateway.clone().bridge_loop(outbound_rx, shutdown));
        gateway
    }

    fn new(config: BridgeConfig) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let gateway = Arc::new(Self {
            config,
            link_up: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            session_open: AtomicBool::new(false),
            link_generation: AtomicU64::new(0),
            request_counter: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound,
            events,
        });
        (gateway, outbound_rx)
    }

    fn next_request_id(&self) -> String {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("send-{id}")
    }

    fn publish(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingSend> {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(request_id),
            Err(poisoned) => poisoned.into_inner().remove(request_id),
        }
    }

    fn insert_pending(&self, request_id: String, sender: PendingSend) {
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(request_id, sender),
            Err(poisoned) => poisoned.into_inner().insert(request_id, sender),
        };
    }

    fn fail_all_pending(&self) {
        let drained: Vec<PendingSend> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, tx)| tx).collect(),
        };
        for tx in drained {
            let _ = tx.send(Err(GatewayError::Closed));
        }
    }

    /// Resolve the waiter of a frame that will never be written.
    fn discard(&self, frame: OutboundFrame) {
        if let Some(request_id) = frame.request_id {
            if let Some(waiter) = self.take_pending(&request_id) {
                let _ = waiter.send(Err(GatewayError::Closed));
            }
        }
    }

    fn open_link(&self) -> u64 {
        let generation = self.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link_up.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        generation
    }

    /// Tear down after a lost link. Frames queued for it are dropped, never
    /// replayed on the next link.
    fn close_link(&self, outbound_rx: &mut mpsc::Receiver<OutboundFrame>) {
        self.link_up.store(false, Ordering::SeqCst);
        self.fail_all_pending();
        let mut dropped = 0usize;
        while let Ok(frame) = outbound_rx.try_recv() {
            self.discard(frame);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(event = "bridge_frames_dropped", count = dropped);
        }
        if self.session_open.swap(false, Ordering::SeqCst) {
            self.publish(GatewayEvent::Disconnected {
                reason: "bridge_link_lost".to_string(),
                logged_out: false,
            });
        }
    }

    async fn push(
        &self,
        generation: u64,
        envelope: BridgeEnvelope,
    ) -> Result<(), GatewayError> {
        let text = encode_frame(&envelope).map_err(|err| GatewayError::Rejected(err.to_string()))?;
        self.outbound
            .send(OutboundFrame {
                generation,
                request_id: envelope.request_id,
                text,
            })
            .await
            .map_err(|_| GatewayError::Closed)
    }

    async fn bridge_loop(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<OutboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let connect = tokio::select! {
                result = connect_async(self.config.url.as_str()) => result,
                _ = shutdown.changed() => break,
            };
            let (mut ws, _) = match connect {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "bridge_connect_error", url = %self.config.url, error = %err);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };
            backoff = Duration::from_secs(1);
            let generation = self.open_link();
            info!(event = "bridge_connected", url = %self.config.url, generation = generation);

            loop {
                tokio::select! {
                    incoming = ws.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(event = "bridge_read_error", error = %err);
                                break;
                            }
                        }
                    }
                    Some(frame) = outbound_rx.recv() => {
                        if frame.generation != generation {
                            debug!(event = "bridge_frame_stale", generation = frame.generation);
                            self.discard(frame);
                            continue;
                        }
                        if let Err(err) = ws.send(Message::Text(frame.text)).await {
                            warn!(event = "bridge_write_error", error = %err);
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }

            self.close_link(&mut outbound_rx);
            warn!(event = "bridge_disconnected", url = %self.config.url);
        }
        info!(event = "bridge_stop");
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match decode_frame(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "bridge_frame_invalid", error = %err);
                return;
            }
        };
        if let Some(event) = envelope.msg.gateway_event() {
            match &event {
                GatewayEvent::Ready(_) => self.session_open.store(true, Ordering::SeqCst),
                GatewayEvent::Disconnected { .. } => {
                    self.session_open.store(false, Ordering::SeqCst)
                }
                GatewayEvent::Qr(_) => {}
            }
            debug!(event = "bridge_lifecycle", kind = ?event);
            self.publish(event);
            return;
        }
        match envelope.msg {
            BridgeMsg::SendResult(result) => {
                let Some(request_id) = envelope.request_id else {
                    warn!(event = "bridge_result_without_id");
                    return;
                };
                let Some(waiter) = self.take_pending(&request_id) else {
                    debug!(event = "bridge_result_orphan", request_id = %request_id);
                    return;
                };
                let outcome = if result.ok {
                    Ok(())
                } else {
                    Err(GatewayError::Rejected(
                        result.error.unwrap_or_else(|| "unknown".to_string()),
                    ))
                };
                let _ = waiter.send(outcome);
            }
            other => {
                warn!(event = "bridge_unexpected_frame", frame = ?other);
            }
        }
    }
}

#[async_trait]
impl SessionGateway for BridgeGateway {
    fn is_ready(&self) -> bool {
        self.link_up.load(Ordering::SeqCst) && self.session_open.load(Ordering::SeqCst)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn send(&self, recipient: &RecipientAddress, text: &str) -> Result<(), GatewayError> {
        if !self.is_ready() {
            return Err(GatewayError::NotConnected);
        }
        let generation = self.link_generation.load(Ordering::SeqCst);
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.insert_pending(request_id.clone(), tx);
        let envelope = BridgeEnvelope::new(BridgeMsg::Send(SendPayload {
            jid: recipient.as_str().to_string(),
            text: text.to_string(),
        }))
        .with_request_id(request_id.clone());
        if let Err(err) = self.push(generation, envelope).await {
            self.take_pending(&request_id);
            return Err(err);
        }
        match tokio::time::timeout(self.config.send_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                self.take_pending(&request_id);
                Err(GatewayError::Timeout(self.config.send_timeout))
            }
        }
    }

    async fn restart(&self, keep_credentials: bool) -> Result<(), GatewayError> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        let generation = self.link_generation.load(Ordering::SeqCst);
        self.session_open.store(false, Ordering::SeqCst);
        info!(event = "bridge_restart", keep_credentials = keep_credentials);
        self.push(
            generation,
            BridgeEnvelope::new(BridgeMsg::Restart(RestartPayload { keep_credentials })),
        )
        .await
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}
