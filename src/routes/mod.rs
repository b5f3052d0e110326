pub mod feed;
pub mod monitor;
pub mod spike;
pub mod ticks;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::{require_api_key, HEALTH_PATH};
use crate::state::SharedState;

pub fn build_router(state: SharedState, api_key: Arc<str>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Tick store ───────────────────────────────────────────────────────
        .route("/api/ticks",         get(ticks::all_ticks))
        .route("/api/ticks/:symbol", get(ticks::get_tick))
        // ── Feed push ────────────────────────────────────────────────────────
        .route("/api/feed/frame",    post(feed::push_frame))
        .route("/api/feed/tick",     post(feed::push_ticks))
        // ── Reactors ─────────────────────────────────────────────────────────
        .route("/api/spike/reset",   post(spike::reset_spike))
        // ── Monitor ──────────────────────────────────────────────────────────
        .route("/ws/ticks",          get(monitor::ws_ticks))
        .route("/ws/orders",         get(monitor::ws_orders))
        .route("/api/positions",     get(monitor::get_positions))
        .route("/api/audit",         get(monitor::get_audit))
        .route(HEALTH_PATH,          get(monitor::health))
        // ── Middleware ───────────────────────────────────────────────────────
        .layer(middleware::from_fn_with_state(api_key, require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::Utc;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tokio::sync::{mpsc, watch};
    use tokio_tungstenite::{connect_async, tungstenite::Message};
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{tests::tick, TickBus};
    use crate::engine::spike::SpikeCommand;
    use crate::fanout::{forward_ticks, ConnectionHub, FeedHealth};
    use crate::feed::normalizer::{QuoteFrame, RawFrame};
    use crate::feed::FeedStats;
    use crate::models::{Account, AuditKind, AuditRecord, SymbolMap};
    use crate::state::AppState;
    use crate::store::memory::build_memory_stores;

    struct Harness {
        state:    SharedState,
        frames:   mpsc::Receiver<RawFrame>,
        commands: mpsc::Receiver<SpikeCommand>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let (frames_tx, frames) = mpsc::channel(16);
        let (commands_tx, commands) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState {
            bus:            Arc::new(TickBus::new(16)),
            symbols:        Arc::new(SymbolMap::parse("408065:INFY,884737:TATAMOTORS")),
            frames:         frames_tx,
            feed_stats:     Arc::new(FeedStats::default()),
            feed_health:    Arc::new(FeedHealth::new(Duration::from_secs(10))),
            tick_hub:       Arc::new(ConnectionHub::new("ticks", 8)),
            order_hub:      Arc::new(ConnectionHub::new("orders", 8)),
            spike_commands: commands_tx,
            stores:         build_memory_stores(None, Account::parse_list("1:key:token")),
            shutdown:       shutdown_rx,
            started_at:     Utc::now(),
        });
        Harness { state, frames, commands, _shutdown: shutdown_tx }
    }

    fn app(h: &Harness, api_key: &str) -> Router {
        build_router(h.state.clone(), Arc::from(api_key))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Serves the router on an ephemeral local port.
    async fn serve(h: &Harness) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(h, "");
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    async fn next_text<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    async fn wait_for_clients(hub: &ConnectionHub, count: usize) {
        for _ in 0..200 {
            if hub.len().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("websocket client never registered");
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn quote(token: i32) -> Vec<u8> {
        QuoteFrame {
            token,
            ltp_paise: 150_050,
            last_trade_time: 1_718_000_000,
            exchange_time: 1_718_000_000,
            ..QuoteFrame::default()
        }
        .encode()
    }

    #[tokio::test]
    async fn unknown_symbol_is_404() {
        let h = harness();
        let (status, body) = call(app(&h, ""), get("/api/ticks/INFY")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn latest_tick_by_symbol_or_token() {
        let h = harness();
        h.state.bus.publish(tick(408065, "INFY", 1500.5)).await;

        let (status, body) = call(app(&h, ""), get("/api/ticks/INFY")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ltp"], 1500.5);

        let (status, body) = call(app(&h, ""), get("/api/ticks/408065")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "INFY");

        let (_, all) = call(app(&h, ""), get("/api/ticks")).await;
        assert_eq!(all["INFY"]["instrument_token"], 408065);
    }

    #[tokio::test]
    async fn binary_frame_is_validated_then_queued() {
        let mut h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/api/feed/frame")
            .body(Body::from(quote(408065)))
            .unwrap();
        let (status, body) = call(app(&h, ""), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 1);
        assert!(matches!(h.frames.try_recv(), Ok(RawFrame::Binary(_))));

        let garbage = Request::builder()
            .method("POST")
            .uri("/api/feed/frame")
            .body(Body::from(vec![0u8; 70]))
            .unwrap();
        let (status, _) = call(app(&h, ""), garbage).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(h.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn envelope_is_split_into_frames() {
        let mut h = harness();
        let (a, b) = (quote(408065), quote(884737));
        let mut envelope = 2u16.to_be_bytes().to_vec();
        for packet in [&a, &b] {
            envelope.extend((packet.len() as u16).to_be_bytes());
            envelope.extend(packet.iter());
        }

        let request = Request::builder()
            .method("POST")
            .uri("/api/feed/frame")
            .header("X-Frame-Envelope", "true")
            .body(Body::from(envelope))
            .unwrap();
        let (status, body) = call(app(&h, ""), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 2);
        assert!(h.frames.try_recv().is_ok());
        assert!(h.frames.try_recv().is_ok());
    }

    #[tokio::test]
    async fn vendor_ticks_accept_object_or_array() {
        let mut h = harness();
        let one = r#"{"instrument_token":408065,"last_price":1500.5,"exchange_timestamp":"2024-06-10T06:13:20Z"}"#;
        let (status, _) = call(app(&h, ""), post_json("/api/feed/tick", one)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let many = format!("[{one},{one}]");
        let (status, body) = call(app(&h, ""), post_json("/api/feed/tick", &many)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 2);

        let mut queued = 0;
        while let Ok(RawFrame::Vendor(_)) = h.frames.try_recv() {
            queued += 1;
        }
        assert_eq!(queued, 3);
    }

    #[tokio::test]
    async fn spike_reset_queues_commands() {
        let mut h = harness();
        let (status, body) = call(app(&h, ""), post_json("/api/spike/reset", "{}")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["reset"], "ALL");
        assert_eq!(h.commands.try_recv().unwrap(), SpikeCommand::ResetAll);

        call(app(&h, ""), post_json("/api/spike/reset", r#"{"symbol":"INFY"}"#)).await;
        assert_eq!(
            h.commands.try_recv().unwrap(),
            SpikeCommand::Reset { symbol: "INFY".into() }
        );
    }

    #[tokio::test]
    async fn api_key_guards_everything_but_health() {
        let h = harness();

        let (status, _) = call(app(&h, "secret"), get("/api/ticks")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(app(&h, "secret"), get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let keyed = Request::builder()
            .uri("/api/ticks")
            .header("X-API-Key", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(app(&h, "secret"), keyed).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn audit_lists_newest_first() {
        let h = harness();
        for subject in ["first", "second"] {
            h.state
                .stores
                .audit
                .append(&AuditRecord::success(subject, AuditKind::Cron, "ok"))
                .await
                .unwrap();
        }

        let (status, body) = call(app(&h, ""), get("/api/audit?limit=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["subject"], "second");
        assert_eq!(body["records"][0]["kind"], "CRON");
    }

    #[tokio::test]
    async fn tick_stream_pushes_published_ticks() {
        let h = harness();
        let addr = serve(&h).await;
        tokio::spawn(forward_ticks(
            h.state.bus.clone(),
            h.state.tick_hub.clone(),
            h.state.shutdown.clone(),
        ));
        while h.state.bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/ticks")).await.unwrap();
        wait_for_clients(&h.state.tick_hub, 1).await;

        h.state.bus.publish(tick(408065, "INFY", 1500.5)).await;
        let pushed = next_text(&mut ws).await;
        assert_eq!(pushed["symbol"], "INFY");
        assert_eq!(pushed["ltp"], 1500.5);
    }

    #[tokio::test]
    async fn viewer_joining_an_outage_is_told_first() {
        let h = harness();
        let start = Utc::now() - chrono::Duration::seconds(60);
        h.state.feed_health.evaluate(None, start, Utc::now());
        assert!(h.state.feed_health.is_stale());
        let addr = serve(&h).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/ticks")).await.unwrap();
        let notice = next_text(&mut ws).await;
        assert_eq!(notice["event"], "FEED_UNAVAILABLE");
        assert_eq!(notice["stale_secs"], 10);

        // Order stream carries no feed-health greeting.
        let (mut orders, _) = connect_async(format!("ws://{addr}/ws/orders")).await.unwrap();
        wait_for_clients(&h.state.order_hub, 1).await;
        h.state.order_hub.broadcast(r#"{"event":"SESSION_SETTLED"}"#.into()).await;
        assert_eq!(next_text(&mut orders).await["event"], "SESSION_SETTLED");
    }
}
