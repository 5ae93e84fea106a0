//! Readiness endpoint used by orchestration health checks.
//!
//! `GET /ready` answers `200` while at least one edge connection serves
//! traffic and `503` otherwise, with a JSON body of the form
//! `{"status":200,"readyConnections":1,"connectorId":"<uuid>"}`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::connection::{Event, EventSink};
use crate::constants::READY_PATH;
use crate::tunnelstate::ConnTracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyBody {
    pub status: u16,
    pub ready_connections: usize,
    pub connector_id: Uuid,
}

#[derive(Debug)]
pub struct ReadyServer {
    tracker: Arc<ConnTracker>,
    connector_id: Uuid,
}

impl ReadyServer {
    pub fn new(tracker: Arc<ConnTracker>, connector_id: Uuid) -> Self {
        Self {
            tracker,
            connector_id,
        }
    }

    pub fn tracker(&self) -> &Arc<ConnTracker> {
        &self.tracker
    }

    pub fn make_response(&self) -> (StatusCode, usize) {
        let ready = self.tracker.count_active_conns();
        if ready > 0 {
            (StatusCode::OK, ready)
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, 0)
        }
    }

    pub fn body(&self) -> (StatusCode, ReadyBody) {
        let (status, ready_connections) = self.make_response();
        (
            status,
            ReadyBody {
                status: status.as_u16(),
                ready_connections,
                connector_id: self.connector_id,
            },
        )
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(READY_PATH, get(ready_handler))
            .with_state(self)
    }
}

impl EventSink for ReadyServer {
    fn on_tunnel_event(&self, event: Event) {
        self.tracker.on_tunnel_event(event);
    }
}

async fn ready_handler(State(server): State<Arc<ReadyServer>>) -> impl IntoResponse {
    let (status, body) = server.body();
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EventKind;

    fn server() -> ReadyServer {
        ReadyServer::new(Arc::new(ConnTracker::new()), Uuid::nil())
    }

    #[test]
    fn test_make_response_tracks_events() {
        let rs = server();

        let (code, ready) = rs.make_response();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ready, 0);

        rs.on_tunnel_event(Event::new(1, EventKind::Connected));
        assert_eq!(rs.make_response(), (StatusCode::OK, 1));

        rs.on_tunnel_event(Event::new(2, EventKind::Connected));
        assert_eq!(rs.make_response(), (StatusCode::OK, 2));

        rs.on_tunnel_event(Event::new(2, EventKind::Reconnecting));
        assert_eq!(rs.make_response(), (StatusCode::OK, 1));

        rs.on_tunnel_event(Event::new(1, EventKind::RegisteringTunnel));
        assert_eq!(rs.make_response(), (StatusCode::SERVICE_UNAVAILABLE, 0));

        rs.on_tunnel_event(Event::new(1, EventKind::Connected));
        assert_eq!(rs.make_response(), (StatusCode::OK, 1));

        rs.on_tunnel_event(Event::new(1, EventKind::Unregistering));
        assert_eq!(rs.make_response(), (StatusCode::SERVICE_UNAVAILABLE, 0));

        rs.on_tunnel_event(Event::new(1, EventKind::Disconnected));
        assert_eq!(rs.make_response(), (StatusCode::SERVICE_UNAVAILABLE, 0));
    }

    #[test]
    fn test_body_json_shape() {
        let rs = server();

        let (code, body) = rs.body();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"status":503,"readyConnections":0,"connectorId":"00000000-0000-0000-0000-000000000000"}"#
        );

        rs.on_tunnel_event(Event::new(0, EventKind::Connected));
        let (code, body) = rs.body();
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "status": 200,
                "readyConnections": 1,
                "connectorId": "00000000-0000-0000-0000-000000000000",
            })
        );
    }
}
