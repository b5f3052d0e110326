//! # feed::upstream
//!
//! Vendor ticker WebSocket client. Subscribes the configured instrument
//! tokens in full mode, splits each binary message into quote packets and
//! forwards them to the ingest channel.
//!
//! The upstream must emit the 17-field quote frame described in
//! [`super::normalizer`] (68-byte header plus whole 12-byte depth entries).
//! Kite's native 184-byte full-mode packet does not fit that layout and is
//! dropped as `BadLength`; point `FEED_WS_URL` at a relay that re-encodes.
//!
//! A lost connection is `UpstreamUnavailable`: reconnect with exponential
//! backoff (1s doubling, capped), resume from current state, no replay.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::normalizer::{split_packets, RawFrame};
use crate::error::AppError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Doubles `current`, never exceeding `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Reconnecting feed loop. Returns once shutdown is signalled or the ingest
/// side has gone away.
pub async fn run_upstream(
    url:          String,
    tokens:       Vec<u32>,
    frames:       mpsc::Sender<RawFrame>,
    max_backoff:  Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let outcome = tokio::select! {
            result = stream_once(&url, &tokens, &frames, &mut backoff) => result,
            _ = shutdown.changed() => break,
        };

        match outcome {
            Ok(()) => {
                info!("📡 Ingest channel closed — upstream feed stopping");
                break;
            }
            Err(err) => {
                warn!(error = %err, retry_in = ?backoff, "📡 Upstream feed unavailable — reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = next_backoff(backoff, max_backoff);
    }

    info!("📡 Upstream feed loop stopped");
}

/// One connection lifetime. `Ok(())` means the ingest side closed.
async fn stream_once(
    url:     &str,
    tokens:  &[u32],
    frames:  &mpsc::Sender<RawFrame>,
    backoff: &mut Duration,
) -> Result<(), AppError> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| AppError::UpstreamUnavailable(format!("connect failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    for message in subscribe_messages(tokens) {
        sink.send(Message::Text(message))
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("subscribe failed: {e}")))?;
    }
    info!(tokens = tokens.len(), "📡 Upstream feed connected and subscribed");
    *backoff = INITIAL_BACKOFF;

    while let Some(message) = stream.next().await {
        let message = message
            .map_err(|e| AppError::UpstreamUnavailable(format!("read failed: {e}")))?;

        match message {
            Message::Binary(bytes) => {
                let packets = match split_packets(&bytes) {
                    Ok(packets) => packets,
                    Err(err) => {
                        warn!(error = %err, "⚠️ Dropping malformed feed message");
                        continue;
                    }
                };
                for packet in packets {
                    if frames.send(RawFrame::Binary(packet.to_vec())).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Text(text) => debug!(%text, "upstream text message"),
            Message::Ping(data) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Message::Close(frame) => {
                return Err(AppError::UpstreamUnavailable(format!(
                    "server closed connection: {frame:?}"
                )));
            }
            _ => {}
        }
    }

    error!("📡 Upstream stream ended without close frame");
    Err(AppError::UpstreamUnavailable("stream ended".into()))
}

/// Subscribe + full-mode requests for the vendor ticker protocol.
pub fn subscribe_messages(tokens: &[u32]) -> Vec<String> {
    vec![
        json!({ "a": "subscribe", "v": tokens }).to_string(),
        json!({ "a": "mode", "v": ["full", tokens] }).to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn subscribe_requests_full_mode() {
        let messages = subscribe_messages(&[408065, 884737]);
        let mode: serde_json::Value = serde_json::from_str(&messages[1]).unwrap();
        assert_eq!(messages[0], r#"{"a":"subscribe","v":[408065,884737]}"#);
        assert_eq!(mode["v"][0], "full");
        assert_eq!(mode["v"][1][1], 884737);
    }

    #[test]
    fn native_full_mode_packet_is_rejected() {
        use crate::feed::normalizer::{normalize, DecodeError};
        use crate::models::SymbolMap;

        let packet = vec![0u8; 184];
        let mut message = 1u16.to_be_bytes().to_vec();
        message.extend_from_slice(&184u16.to_be_bytes());
        message.extend_from_slice(&packet);

        let packets = split_packets(&message).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            normalize(&RawFrame::Binary(packets[0].to_vec()), &SymbolMap::default()),
            Err(DecodeError::BadLength { len: 184 })
        );
    }
}
