//! Streaming ingestor: persistent websocket, one JSON tick per message.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{info, warn};

use tickline_core::{RawTick, ShutdownSignal};
use tickline_store::Backoff;
use tickline_telemetry::PipelineMetrics;

use crate::TickSender;

/// Reconnect backoff; resets after the first successfully decoded message.
fn reconnect_backoff() -> Backoff {
    Backoff {
        base: Duration::from_millis(500),
        factor: 2.0,
        max: Duration::from_secs(30),
        jitter: true,
    }
}

pub(crate) async fn run(
    url: &str,
    sender: &TickSender,
    metrics: &Arc<PipelineMetrics>,
    shutdown: &ShutdownSignal,
) {
    let backoff = reconnect_backoff();
    let mut attempt = 0u32;

    while !shutdown.triggered() {
        info!(url, "dialing websocket");
        let mut socket = match connect_async(url).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                warn!(url, error = %err, "ws dial error");
                metrics.inc_ingest_error();
                if !shutdown.sleep(backoff.delay(attempt)).await {
                    return;
                }
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                _ = shutdown.wait() => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                msg = socket.next() => msg,
            };

            match message {
                Some(Ok(Message::Text(text))) => match decode_tick(&text) {
                    Ok(tick) => {
                        attempt = 0;
                        sender.offer(tick);
                    }
                    Err(reason) => {
                        warn!(url, %reason, "invalid feed payload");
                        metrics.inc_ingest_error();
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        warn!(url, error = %err, "failed to answer ping");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(url, "websocket closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(url, error = %err, "ws read error");
                    metrics.inc_ingest_error();
                    break;
                }
            }
        }

        if !shutdown.sleep(backoff.delay(attempt)).await {
            return;
        }
        attempt = attempt.saturating_add(1);
    }
}

fn decode_tick(text: &str) -> Result<RawTick, String> {
    let mut tick: RawTick = serde_json::from_str(text).map_err(|err| err.to_string())?;
    tick.sanitize();
    tick.validate().map_err(|err| err.to_string())?;
    Ok(tick)
}
