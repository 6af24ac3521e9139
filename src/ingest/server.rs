//! Ingest server
//!
//! HTTP server that accepts log records and hands them to a [`Dispatcher`].

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::item::Level;
use crate::pipeline::Dispatcher;

use super::{IngestRecord, IngestReply};

/// Handle to control the running server
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: SocketAddr,
}

impl ServerHandle {
    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server gracefully
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            // Ignore error if receiver is already dropped
            let _ = tx.send(());
        }
        Ok(())
    }
}

fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/log", post(log_handler))
        .route("/health", get(health_handler))
        .with_state(dispatcher)
}

/// Start the ingest server on 127.0.0.1
///
/// Port 0 lets the OS pick a free port; see [`ServerHandle::addr`].
pub async fn start(port: u16, dispatcher: Dispatcher) -> Result<ServerHandle> {
    let app = router(dispatcher);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Ingest server listening on {}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
                info!("Ingest server shutting down");
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        shutdown_tx: Some(shutdown_tx),
        addr: bound_addr,
    })
}

/// POST /log handler
async fn log_handler(
    State(dispatcher): State<Dispatcher>,
    Json(record): Json<IngestRecord>,
) -> Result<(StatusCode, Json<IngestReply>), (StatusCode, String)> {
    let level: Level = record.level.parse().map_err(|e| {
        debug!(level = %record.level, "Rejected record with unknown level");
        (StatusCode::BAD_REQUEST, format!("{}", e))
    })?;

    if dispatcher.is_closed() {
        warn!("Record received after pipeline shutdown");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "log pipeline is shut down".to_string(),
        ));
    }

    let tag = record.tag.unwrap_or_else(|| dispatcher.tag());
    let id = dispatcher
        .submit(level, tag.clone(), record.message, record.fields)
        .await;
    debug!(?id, tag = %tag, %level, "Accepted record");

    Ok((StatusCode::OK, Json(IngestReply { id })))
}

/// GET /health handler
async fn health_handler(State(dispatcher): State<Dispatcher>) -> StatusCode {
    if dispatcher.is_closed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchMode;
    use crate::item::LogItem;
    use crate::store::{Store, StoreError};
    use axum::{body::Body, http::Request};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingStore {
        items: Mutex<Vec<LogItem>>,
    }

    impl Store for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        fn store(&self, item: &LogItem) -> Result<(), StoreError> {
            self.items.lock().unwrap().push(item.clone());
            Ok(())
        }

        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn direct_dispatcher() -> (Dispatcher, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .tag("ingest")
            .min_level(Level::Info)
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();
        (dispatcher, store)
    }

    fn post_log(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/log")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_log_handler_accepts_record() {
        let (dispatcher, store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log(
                r#"{"level":"WARN","tag":"worker","message":"slow job","fields":{"ms":1200}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let items = store.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].level, Level::Warn);
        assert_eq!(items[0].tag, "worker");
        assert_eq!(items[0].message, "slow job");
        assert_eq!(items[0].fields["ms"], json!(1200));
    }

    #[tokio::test]
    async fn test_log_handler_default_tag() {
        let (dispatcher, store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log(r#"{"level":"info","message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.items.lock().unwrap()[0].tag, "ingest");
    }

    #[tokio::test]
    async fn test_log_handler_filtered_level() {
        let (dispatcher, store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log(r#"{"level":"debug","message":"noise"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_handler_unknown_level() {
        let (dispatcher, _store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log(r#"{"level":"loud","message":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_handler_invalid_json() {
        let (dispatcher, _store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log("not valid json"))
            .await
            .unwrap();
        // Axum returns 400 Bad Request for JSON syntax errors
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_handler_missing_message() {
        let (dispatcher, _store) = direct_dispatcher();

        let response = router(dispatcher)
            .oneshot(post_log(r#"{"level":"info"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_health_after_shutdown() {
        let (dispatcher, _store) = direct_dispatcher();
        let app = router(dispatcher.clone());

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        dispatcher.shutdown().await.unwrap();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(post_log(r#"{"level":"info","message":"late"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (dispatcher, _store) = direct_dispatcher();

        let handle = start(0, dispatcher).await.unwrap();
        let addr = handle.addr();

        // Server should be running
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        handle.shutdown().unwrap();

        // Give server time to shut down
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        // Server should be stopped (connection refused)
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
