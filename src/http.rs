//! JSON command endpoint.
//!
//! - `POST /command`: body is a command object, reply is its result
//! - `GET /readings`: today's progress map
//! - `GET /order`: `{"order": [...]}`
//!
//! Scheduler calls take the state lock and may touch disk or the network,
//! so every handler runs them on the blocking pool.

use crate::command::{Command, CommandError, CommandResponse};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::Readings;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("handler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        ApiError::Scheduler(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Scheduler(SchedulerError::Command(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Router over a shared scheduler.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/command", post(command))
        .route("/readings", get(readings))
        .route("/order", get(order))
        .with_state(scheduler)
}

/// Serve the endpoint on `bind` until `shutdown` resolves.
pub async fn serve(
    scheduler: Arc<Scheduler>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "command endpoint listening");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn command(
    State(scheduler): State<Arc<Scheduler>>,
    Json(body): Json<Value>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = Command::from_json(&body)?;
    debug!(?command, "handling command");
    let response = tokio::task::spawn_blocking(move || scheduler.handle(&command)).await??;
    Ok(Json(response))
}

async fn readings(State(scheduler): State<Arc<Scheduler>>) -> Result<Json<Readings>, ApiError> {
    let readings = tokio::task::spawn_blocking(move || scheduler.readings()).await??;
    Ok(Json(readings))
}

async fn order(State(scheduler): State<Arc<Scheduler>>) -> Json<CommandResponse> {
    Json(CommandResponse::Order {
        order: scheduler.order(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::FakeBoard;
    use crate::config::{SchedulerConfig, ZoneConfig};
    use crate::ledger::FileLedger;
    use crate::weather::StaticWeather;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn scheduler(dir: &TempDir) -> Arc<Scheduler> {
        let mut zones = BTreeMap::new();
        for (name, pin, minutes) in [("a", "1", 10), ("b", "2", 20)] {
            zones.insert(
                name.to_string(),
                ZoneConfig {
                    pin: pin.to_string(),
                    minutes,
                    priority: 0,
                },
            );
        }
        Arc::new(
            Scheduler::new(
                SchedulerConfig::new("fake", zones),
                &FakeBoard::new(),
                Box::new(FileLedger::open(dir.path()).unwrap()),
                Arc::new(StaticWeather::default()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_endpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = router(scheduler(&dir));
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });
        let client = reqwest::Client::new();

        let order: Value = client
            .get(format!("{base}/order"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(order, json!({"order": ["b", "a"]}));

        let resp = client
            .post(format!("{base}/command"))
            .json(&json!({"cmd": "markZoneTime", "zone": "a", "minutes": 2.5}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({}));

        let resp = client
            .post(format!("{base}/command"))
            .json(&json!({"cmd": "dance"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.json::<Value>().await.unwrap()["error"].is_string());

        let resp = client
            .post(format!("{base}/command"))
            .json(&json!({"cmd": "run", "zone": "zz", "minutes": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let readings: Value = client
            .get(format!("{base}/readings"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(readings["a"], 2.5);
        assert_eq!(readings["b-configured"], 20);
        assert_eq!(readings["running"], "");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
