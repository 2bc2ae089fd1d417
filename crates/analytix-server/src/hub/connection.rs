//! Per-connection WebSocket task.
//!
//! Reads client frames, writes queued deliveries, pings on an interval and
//! declares the peer dead when nothing arrives for
//! `heartbeat_interval + heartbeat_timeout`.

use std::time::Duration;

use analytix_core::{ClientMessage, StreamEnvelope};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

use super::{Delivery, Subscription};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    SocketError,
    HeartbeatTimeout,
    Shutdown,
    Forced,
}

impl Exit {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SocketError => "socket_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::Forced => "forced",
        }
    }
}

type Sink = SplitSink<WebSocket, Message>;
type Stream = SplitStream<WebSocket>;

/// Runs one stream connection until either side ends it.
pub async fn serve_connection(socket: WebSocket, mut subscription: Subscription) {
    let id = subscription.id();
    let config = subscription.hub().config().clone();
    let force_close = subscription.hub().force_close_token();

    tracing::info!(connection = %id, "stream connection established");

    let (mut sink, mut stream) = socket.split();
    let mut ping = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle_limit = config.heartbeat_interval + config.heartbeat_timeout;
    let idle = sleep(idle_limit);
    tokio::pin!(idle);

    let exit = loop {
        tokio::select! {
            _ = force_close.cancelled() => break Exit::Forced,

            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_limit);
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&mut subscription, text.as_str()).await;
                        if send_envelope(&mut sink, &reply).await.is_err() {
                            break Exit::SocketError;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = StreamEnvelope::error("binary frames are not supported");
                        if send_envelope(&mut sink, &reply).await.is_err() {
                            break Exit::SocketError;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break Exit::ClientClosed,
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, error = %e, "stream read failed");
                        break Exit::SocketError;
                    }
                }
            }

            delivery = subscription.recv() => match delivery {
                Delivery::Event(envelope) => {
                    if send_envelope(&mut sink, &envelope).await.is_err() {
                        break Exit::SocketError;
                    }
                }
                Delivery::Dropped(count) => {
                    tracing::warn!(connection = %id, dropped = count, "slow stream consumer");
                    if send_envelope(&mut sink, &StreamEnvelope::dropped(count)).await.is_err() {
                        break Exit::SocketError;
                    }
                }
                Delivery::Close => break Exit::Shutdown,
            },

            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break Exit::SocketError;
                }
            }

            _ = &mut idle => {
                metrics::record_stream_heartbeat_timeout();
                break Exit::HeartbeatTimeout;
            }
        }
    };

    if matches!(exit, Exit::Shutdown | Exit::Forced) {
        // Bounded so a stuck peer cannot hold up shutdown.
        let goodbye = say_goodbye(&mut sink, &mut stream);
        if tokio::time::timeout(config.heartbeat_timeout.max(Duration::from_secs(1)), goodbye)
            .await
            .is_err()
        {
            tracing::debug!(connection = %id, "close handshake timed out");
        }
    }

    tracing::info!(
        connection = %id,
        reason = exit.as_str(),
        topics = subscription.topics().len(),
        "stream connection closed"
    );
}

async fn handle_client_message(subscription: &mut Subscription, text: &str) -> StreamEnvelope {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe { topics }) => match subscription.subscribe(topics).await {
            Ok(all) => StreamEnvelope::subscribed(all),
            Err(e) => StreamEnvelope::error(e.to_string()),
        },
        Ok(ClientMessage::Unsubscribe { topics }) => match subscription.unsubscribe(topics).await {
            Ok(remaining) => StreamEnvelope::unsubscribed(remaining),
            Err(e) => StreamEnvelope::error(e.to_string()),
        },
        Ok(ClientMessage::Ping) => StreamEnvelope::pong(),
        Err(e) => StreamEnvelope::error(e.to_string()),
    }
}

async fn send_envelope(sink: &mut Sink, envelope: &StreamEnvelope) -> Result<(), axum::Error> {
    match envelope.to_json() {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode stream envelope");
            Ok(())
        }
    }
}

/// Sends the closing envelope and a going-away close frame, then waits for
/// the peer's close reply so the socket is not dropped mid-handshake.
async fn say_goodbye(sink: &mut Sink, stream: &mut Stream) {
    let _ = send_envelope(sink, &StreamEnvelope::closing("server shutting down")).await;
    let sent = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        })))
        .await;
    if sent.is_err() {
        return;
    }
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
