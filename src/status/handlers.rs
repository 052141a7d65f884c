use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::websocket::StatusSnapshot;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStatusResponse {
    pub last_status_received: Option<String>,
    pub total_connected_clients: usize,
}

impl From<StatusSnapshot> for CurrentStatusResponse {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            last_status_received: snapshot.last_status_received,
            total_connected_clients: snapshot.total_connected_clients,
        }
    }
}

fn remote_addr(req: &HttpRequest, trust_forwarded_headers: bool) -> String {
    let info = req.connection_info();
    let addr = if trust_forwarded_headers {
        info.realip_remote_addr()
    } else {
        info.peer_addr()
    };
    addr.unwrap_or("unknown").to_string()
}

pub async fn current(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let peer = remote_addr(&req, state.config.relay.trust_forwarded_headers);
    info!("Get current status from {}", peer);

    let snapshot = state.relay.registry().snapshot().await;
    HttpResponse::Ok().json(CurrentStatusResponse::from(snapshot))
}

pub async fn test() -> HttpResponse {
    HttpResponse::Ok().body("test")
}
