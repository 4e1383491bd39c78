//! Upgrade request routing.
//!
//! Decides, from the HTTP upgrade request alone, whether a connection is a
//! client peer or a service worker. Requests that match neither endpoint, or
//! that name an unknown service, are refused before the upgrade completes.

use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::relay::{PeerInfo, Relay};

/// Default payload protocol for client peers
pub const DEFAULT_PROTOCOL: &str = "json";

/// Upgrade paths served by the gateway
#[derive(Debug, Clone)]
pub struct Paths {
    pub client: String,
    pub worker: String,
}

/// Where an upgraded connection goes
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Client(PeerInfo),
    Worker { service: String },
}

/// Route an upgrade request, or build the HTTP error to refuse it with
pub fn route(
    req: &Request,
    paths: &Paths,
    relay: &Relay,
    addr: SocketAddr,
) -> Result<Route, ErrorResponse> {
    let path = req.uri().path();
    let query = req.uri().query().unwrap_or("");

    if path == paths.client {
        let service = required_service(query, relay)?;
        let info = PeerInfo {
            protocol: query_param(query, "protocol")
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_PROTOCOL)
                .to_string(),
            client_id: query_param(query, "client_id").unwrap_or("").to_string(),
            ip: client_ip(req, addr),
            service,
            service_token: query_param(query, "service_token")
                .unwrap_or("")
                .to_string(),
            identity: Default::default(),
        };
        Ok(Route::Client(info))
    } else if path == paths.worker {
        let service = required_service(query, relay)?;
        Ok(Route::Worker { service })
    } else {
        Err(reject(
            StatusCode::NOT_FOUND,
            format!("No endpoint at '{}'", path),
        ))
    }
}

fn required_service(query: &str, relay: &Relay) -> Result<String, ErrorResponse> {
    let service = match query_param(query, "service") {
        Some(s) if !s.is_empty() => s,
        _ => {
            return Err(reject(
                StatusCode::BAD_REQUEST,
                "Missing 'service' parameter".to_string(),
            ))
        }
    };
    if !relay.services().contains(&service.to_string()) {
        return Err(reject(
            StatusCode::NOT_FOUND,
            format!("Unknown service '{}'", service),
        ));
    }
    Ok(service.to_string())
}

/// First value of `key` in a `k=v&k=v` query string
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}

/// Originating address: first `X-Forwarded-For` hop, else the socket peer
fn client_ip(req: &Request, addr: SocketAddr) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

fn reject(status: StatusCode, message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = status;
    response
}
