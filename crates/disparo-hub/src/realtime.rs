//! Publish-only observer channel: every [`DispatchEvent`] goes out as a JSON
//! text frame. Observers never talk back beyond close and pong frames.

use crate::context::AppContext;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use disparo_core::events::DispatchEvent;
use futures_util::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const OBSERVER_BUFFER: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(ctx, socket))
}

/// Queue one event on the observer's writer. `false` once the writer is gone.
async fn send_event(sender: &mpsc::Sender<Message>, event: &DispatchEvent) -> bool {
    let text = match event.to_json() {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "observer_encode_error", kind = event.name(), error = %err);
            return true;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}

async fn send_greeting(ctx: &AppContext, sender: &mpsc::Sender<Message>) -> bool {
    for event in ctx.greeting().await {
        if !send_event(sender, &event).await {
            return false;
        }
    }
    true
}

fn start_ping(
    sender: mpsc::Sender<Message>,
    interval: Duration,
    conn_id: String,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender.send(Message::Ping(Vec::new())).await.is_err() {
                debug!(event = "ping_failed", conn_id = %conn_id);
                return;
            }
        }
    }))
}

pub async fn observe(ctx: Arc<AppContext>, socket: WebSocket) {
    let conn_id = ctx.next_observer_id();
    let observer = ctx.observer_config().clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OBSERVER_BUFFER);
    let write_timeout = observer.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
    });

    let mut events = ctx.subscribe_events();
    info!(event = "observer_connected", conn_id = %conn_id);
    let ping_task = start_ping(tx.clone(), observer.ping_interval, conn_id.clone());

    let mut open = send_greeting(&ctx, &tx).await;
    while open {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => open = false,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "observer_read_error", conn_id = %conn_id, error = %err);
                        open = false;
                    }
                }
            }
            published = events.recv() => {
                match published {
                    Ok(event) => open = send_event(&tx, &event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "observer_lagged", conn_id = %conn_id, skipped = skipped);
                        open = send_greeting(&ctx, &tx).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => open = false,
                }
            }
        }
    }

    if let Some(handle) = ping_task {
        handle.abort();
    }
    drop(tx);
    let _ = write_task.await;
    info!(event = "observer_disconnected", conn_id = %conn_id);
}

#[cfg(test)]
mod tests {
    use crate::context::testing::harness;
    use crate::routes::{build_router, RouterOptions};
    use disparo_core::events::{DispatchEvent, QrCodePayload, SessionCompletePayload};
    use disparo_core::session::GatewayEvent;
    use disparo_core::BatchTotals;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    async fn next_event<S>(stream: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("frame in time")
                .expect("open stream")
                .expect("valid frame");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    #[tokio::test]
    async fn observer_gets_greeting_then_published_events() {
        let h = harness();
        h.ctx
            .apply_gateway_event(GatewayEvent::Qr("2@pairing".to_string()))
            .await;
        let app = build_router(
            h.ctx.clone(),
            &RouterOptions {
                cors_origins: Vec::new(),
                max_upload_bytes: 1024,
            },
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let greeting = next_event(&mut ws).await;
        assert_eq!(
            serde_json::from_value::<DispatchEvent>(greeting).expect("event"),
            DispatchEvent::QrCode(QrCodePayload {
                qr: "2@pairing".to_string()
            })
        );

        // the observer subscribes before greeting, so this cannot be missed
        h.ctx.publish(DispatchEvent::SessionComplete(SessionCompletePayload {
            session_id: "1700000000000".to_string(),
            results: BatchTotals {
                total: 3,
                sent: 2,
                failed: 1,
            },
        }));
        let frame = next_event(&mut ws).await;
        assert_eq!(frame["event"], "sessionComplete");
        assert_eq!(frame["data"]["sessionId"], "1700000000000");
        assert_eq!(frame["data"]["results"]["failed"], 1);
    }
}
