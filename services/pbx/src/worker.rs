//! Outer supervisor loop (spec.md §4.5): connects the ARI event socket,
//! decodes frames, dispatches to the [`CallService`], and reconnects with a
//! fixed backoff on any connection loss.
//!
//! Grounded on `app/main.py`'s `main()` — the same `websockets.connect` loop,
//! per-message `json.loads`/parse/dispatch, and "log and continue" error
//! policy — re-expressed with `tokio_tungstenite`/`futures_util::StreamExt`
//! in the idiom `Detair-kaiku/server/src/voice/ws_handler.rs` uses for its
//! own WebSocket consumption.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::ari::{parse_event, AriPort};
use crate::call_service::CallService;
use crate::recorder::Recorder;

/// Delay between a dropped event socket and the next reconnect attempt
/// (spec.md §4.5 step 5: "sleep ~3 seconds and reconnect").
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Run the event loop until `shutdown` resolves.
///
/// Each iteration of the outer loop is one connection attempt: connect, read
/// frames until the socket closes or errors, then sleep and try again. A
/// single bad frame or a single failed `handle_event` never brings the loop
/// down — only the `shutdown` future does.
pub async fn run<A, R>(
    ws_url: &str,
    service: &CallService<A, R>,
    shutdown: impl std::future::Future<Output = ()>,
) where
    A: AriPort + 'static,
    R: Recorder + 'static,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping worker loop");
                return;
            }
            () = run_one_connection(ws_url, service) => {}
        }

        info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting to event socket");
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received during reconnect backoff");
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Connect once and consume frames until the socket closes or errors.
async fn run_one_connection<A, R>(ws_url: &str, service: &CallService<A, R>)
where
    A: AriPort + 'static,
    R: Recorder + 'static,
{
    let (stream, _response) = match tokio_tungstenite::connect_async(ws_url).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, "failed to connect to ari event socket");
            return;
        }
    };
    info!("connected to ari event socket");

    let (_write, mut read) = stream.split();

    while let Some(frame) = read.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "event socket read error, reconnecting");
                return;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "non-utf8 binary frame, skipping");
                    continue;
                }
            },
            Message::Close(_) => {
                info!("event socket closed by peer");
                return;
            }
            // Ping/pong/frame are handled transparently by tungstenite.
            _ => continue,
        };

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "failed to decode event frame, skipping");
                continue;
            }
        };

        let event = parse_event(value);
        service.handle_event(event).await;
    }
}
