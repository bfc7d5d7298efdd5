//! A hyper based http server exposing the provisioning REST API, the captive
//! portal probe endpoints and the `/ws` status stream.
//!
//! ## Crossmodule usage
//! Scans go straight to the network adapter (rate limited and cached here);
//! connect/disconnect are forwarded to the orchestrator; `/api/status` and
//! `/ws` read the state store.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{info, warn};
use serde::Deserialize;

use crate::config::Config;
use crate::errors::{ErrorCode, ProvisionError};
use crate::network::{dedupe_networks, NetworkAdapter, SCAN_BUSY_RETRY};
use crate::orchestrator::{ConnectReply, OrchestratorHandle};
use crate::state::{ConnectionState, WifiNetwork};
use crate::store::StateStore;

pub mod ws;

/// Scans are served from cache inside this window, and always while a
/// connection attempt holds the radio.
const SCAN_CACHE_TTL: Duration = Duration::from_secs(5);

/// Placeholder pages; the real UI ships with the device image.
const SETUP_PAGE: &str = "<!DOCTYPE html><html><head><title>WiFi Setup</title></head>\
<body><h1>Device WiFi Setup</h1><p>Loading setup interface&hellip;</p></body></html>";
const DASHBOARD_PAGE: &str = "<!DOCTYPE html><html><head><title>Device</title></head>\
<body><h1>Device Dashboard</h1></body></html>";

#[derive(Deserialize, Debug)]
pub struct ConnectRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

struct ScanCache {
    taken_at: Option<Instant>,
    networks: Vec<WifiNetwork>,
}

/// Shared server state, one per process.
pub struct HttpServerState {
    pub store: Arc<StateStore>,
    pub orchestrator: OrchestratorHandle,
    pub adapter: Arc<dyn NetworkAdapter>,
    pub config: Config,
    scan_cache: tokio::sync::Mutex<ScanCache>,
    /// Sessions with a connect request currently being processed
    inflight_sessions: Mutex<HashSet<String>>,
}

pub type SharedState = Arc<HttpServerState>;

pub fn shared_state(
    store: Arc<StateStore>,
    orchestrator: OrchestratorHandle,
    adapter: Arc<dyn NetworkAdapter>,
    config: Config,
) -> SharedState {
    Arc::new(HttpServerState {
        store,
        orchestrator,
        adapter,
        config,
        scan_cache: tokio::sync::Mutex::new(ScanCache { taken_at: None, networks: Vec::new() }),
        inflight_sessions: Mutex::new(HashSet::new()),
    })
}

/// Bind and serve until the process ends. Binding errors surface to the
/// caller; everything after that is logged.
pub async fn run_server(state: SharedState, addr: SocketAddr) -> Result<(), ProvisionError> {
    let make_service = make_service_fn(move |_socket| {
        let state = state.clone();
        async move {
            let service = service_fn(move |req| router(state.clone(), req));
            Ok::<_, hyper::Error>(service)
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| ProvisionError::Generic(format!("Could not bind to {}: {}", addr, e)))?
        .serve(make_service);

    info!("Started http server on {}", addr);
    server.await?;
    Ok(())
}

async fn router(state: SharedState, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = match (method, path.as_str()) {
        (Method::GET, "/api/status") => status(&state),
        (Method::GET, "/api/networks") => networks(&state).await,
        (Method::POST, "/api/connect") => connect(&state, req).await,
        (Method::POST, "/api/disconnect") => disconnect(&state).await,
        (Method::GET, "/ws") => ws::upgrade(state.clone(), req),
        (Method::GET, "/generate_204") => probe(&state, ProbePayload::NoContent),
        (Method::GET, "/hotspot-detect.html") | (Method::GET, "/library/test/success.html") => {
            probe(&state, ProbePayload::AppleSuccess)
        },
        (Method::GET, "/ncsi.txt") => probe(&state, ProbePayload::Ncsi),
        (Method::GET, _) => catch_all(&state, &path),
        _ => json_error(StatusCode::METHOD_NOT_ALLOWED, ErrorCode::BadInput, "method not allowed"),
    };
    Ok(response)
}

/// The status snapshot; `ap_password` only appears while in AP mode.
fn status(state: &SharedState) -> Response<Body> {
    json_response(StatusCode::OK, state.store.get().status_json())
}

/// Trigger a scan, rate limited to one per five seconds. While a connection
/// attempt is in flight the radio is left alone and the cache serves.
async fn networks(state: &SharedState) -> Response<Body> {
    let mut cache = state.scan_cache.lock().await;

    let fresh = cache.taken_at.map(|at| at.elapsed() < SCAN_CACHE_TTL).unwrap_or(false);
    let radio_busy = matches!(
        state.store.get().connection_state,
        ConnectionState::Switching | ConnectionState::Connecting
    );
    if fresh || radio_busy {
        return json_response(StatusCode::OK, serde_json::json!({ "networks": cache.networks }));
    }

    let mut result = state.adapter.scan().await;
    if matches!(result, Err(ProvisionError::ScanBusy)) && cache.taken_at.is_none() {
        // transient: the daemon finishes its own scan shortly
        tokio::time::sleep(SCAN_BUSY_RETRY).await;
        result = state.adapter.scan().await;
    }

    match result {
        Ok(raw) => {
            cache.networks = dedupe_networks(raw);
            cache.taken_at = Some(Instant::now());
            json_response(StatusCode::OK, serde_json::json!({ "networks": cache.networks }))
        },
        Err(ProvisionError::ScanBusy) if cache.taken_at.is_some() => {
            json_response(StatusCode::OK, serde_json::json!({ "networks": cache.networks }))
        },
        Err(e @ ProvisionError::ScanBusy) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, e.code(), &e.to_string())
        },
        Err(e @ ProvisionError::NoWifiDeviceFound) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, e.code(), &e.to_string())
        },
        Err(e) => {
            warn!("Scan failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.code(), &e.to_string())
        },
    }
}

async fn connect(state: &SharedState, req: Request<Body>) -> Response<Body> {
    let session_cookie = client_session(&req);

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) if bytes.len() <= 4096 => bytes,
        Ok(_) => return json_error(StatusCode::BAD_REQUEST, ErrorCode::BadInput, "body too large"),
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, ErrorCode::BadInput, &e.to_string());
        },
    };
    let parsed: ConnectRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, ErrorCode::BadInput, &e.to_string());
        },
    };

    // fast local validation: 400 before anything is touched
    if let Err(e) =
        crate::utils::validate_ssid(&parsed.ssid).and_then(|_| crate::utils::validate_psk(&parsed.password))
    {
        return json_error(StatusCode::BAD_REQUEST, e.code(), &e.to_string());
    }

    // one request in flight per client session
    if let Some(session) = &session_cookie {
        let mut inflight = state.inflight_sessions.lock().expect("session set lock");
        if !inflight.insert(session.clone()) {
            return json_error(
                StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::BadInput,
                "a connect for this session is already in flight",
            );
        }
    }

    let reply = state.orchestrator.connect(parsed.ssid, parsed.password).await;

    if let Some(session) = &session_cookie {
        state.inflight_sessions.lock().expect("session set lock").remove(session);
    }

    match reply {
        ConnectReply::Accepted { session_id } => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({ "session_id": session_id }),
        ),
        ConnectReply::Busy => json_error(
            StatusCode::CONFLICT,
            ErrorCode::BadInput,
            "another connection attempt is in progress",
        ),
        ConnectReply::Rejected(e) => json_error(StatusCode::BAD_REQUEST, e.code(), &e.to_string()),
    }
}

async fn disconnect(state: &SharedState) -> Response<Body> {
    state.orchestrator.disconnect().await;
    json_response(StatusCode::ACCEPTED, serde_json::json!({ "status": "accepted" }))
}

enum ProbePayload {
    NoContent,
    AppleSuccess,
    Ncsi,
}

/// Captive portal probes: redirect into the setup page while the AP is up,
/// answer what each OS expects otherwise.
fn probe(state: &SharedState, payload: ProbePayload) -> Response<Body> {
    if state.store.get().connection_state == ConnectionState::ApMode {
        return redirect_to_setup(state);
    }
    match payload {
        ProbePayload::NoContent => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("static response"),
        ProbePayload::AppleSuccess => html_response(
            "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>",
        ),
        ProbePayload::Ncsi => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", HeaderValue::from_static("text/plain"))
            .body(Body::from("Microsoft NCSI"))
            .expect("static response"),
    }
}

/// `/` and unknown paths: the setup page inside AP mode, the dashboard
/// otherwise.
fn catch_all(state: &SharedState, path: &str) -> Response<Body> {
    if state.store.get().connection_state == ConnectionState::ApMode {
        if path == "/" {
            return html_response(SETUP_PAGE);
        }
        return redirect_to_setup(state);
    }
    html_response(DASHBOARD_PAGE)
}

fn redirect_to_setup(state: &SharedState) -> Response<Body> {
    let location = format!("http://{}:{}/", state.config.ap_ip, state.config.web_port);
    Response::builder()
        .status(StatusCode::FOUND)
        .header("location", location)
        .body(Body::empty())
        .expect("static response")
}

/// The `session_id` cookie distinguishes concurrent provisioning users.
fn client_session(req: &Request<Body>) -> Option<String> {
    let cookies = req.headers().get("cookie")?.to_str().ok()?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == "session_id" && !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", HeaderValue::from_static("application/json"))
        .body(Body::from(value.to_string()))
        .expect("json response")
}

fn json_error(status: StatusCode, code: ErrorCode, message: &str) -> Response<Body> {
    json_response(
        status,
        serde_json::json!({ "error": { "code": code.as_str(), "message": message } }),
    )
}

fn html_response(page: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", HeaderValue::from_static("text/html; charset=utf-8"))
        .body(Body::from(page))
        .expect("html response")
}

/// Probe the configured bind address before any side effect happens; a
/// occupied port is a fatal startup error.
pub async fn test_bind(addr: SocketAddr) -> Result<(), ProvisionError> {
    let socket = tokio::net::TcpListener::bind(addr).await.map_err(|_| {
        ProvisionError::Generic(format!(
            "Could not bind to {:?}\nEither the port is blocked or permissions are required.",
            addr
        ))
    })?;
    drop(socket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::network::mock::MockAdapter;
    use crate::orchestrator::Orchestrator;
    use crate::state::{ConnectionState, Security};
    use crate::store::StatePatch;
    use crate::{captive::CaptivePortal, tunnel};

    pub(crate) async fn test_state(
        adapter: Arc<MockAdapter>,
    ) -> (SharedState, Arc<MockAdapter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.enable_captive_portal = false;
        config.tunnel_enabled = false;
        config.state_dir = dir.path().to_owned();

        let store = Arc::new(StateStore::load(&config.state_file()));
        let identity = DeviceIdentity::from_mac("b8:27:eb:12:34:ab", "distiller").unwrap();
        let captive = CaptivePortal::new(
            "wlan0".to_owned(),
            config.ap_ip,
            config.web_port,
            dir.path().to_owned(),
            None,
        );
        let tunnel = tunnel::spawn(config.clone(), identity.hostname.clone(), store.clone());
        let (orchestrator, handle) = Orchestrator::new(
            config.clone(),
            identity,
            store.clone(),
            adapter.clone(),
            captive,
            tunnel,
        );
        tokio::spawn(orchestrator.run());

        (shared_state(store, handle, adapter.clone(), config), adapter, dir)
    }

    pub(crate) async fn wait_for_state(store: &StateStore, expected: ConnectionState) {
        let mut rx = store.subscribe();
        tokio::time::timeout(Duration::from_secs(60), async {
            while rx.borrow().connection_state != expected {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached");
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().method(Method::GET).uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn status_includes_password_only_in_ap_mode() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        let response = router(state.clone(), get("/api/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "AP_MODE");
        assert_eq!(json["ap_password"].as_str().unwrap().len(), crate::utils::AP_PASSWORD_LEN);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_input_yields_400_and_no_state_change() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;
        let before = state.store.get();

        for body in [
            r#"{"ssid":"HomeNet","password":"short"}"#,
            r#"{"ssid":"bad;net","password":"hunter2hunter2"}"#,
            r#"{"ssid":"bad`net","password":"hunter2hunter2"}"#,
            r#"{"ssid":"","password":"hunter2hunter2"}"#,
            r#"{"ssid":"HomeNet","password":"pipe|pipe|pipe"}"#,
            "not json at all",
        ] {
            let response =
                router(state.clone(), post_json("/api/connect", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "accepted {}", body);
        }

        let after = state.store.get();
        assert_eq!(before.connection_state, after.connection_state);
        assert_eq!(before.session_id, after.session_id);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_returns_accepted_with_session_id() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        let response = router(
            state.clone(),
            post_json("/api/connect", r#"{"ssid":"HomeNet","password":"hunter2hunter2"}"#),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert!(json["session_id"].as_str().is_some());

        wait_for_state(&state.store, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn scan_is_cached_within_ttl() {
        let adapter = MockAdapter::new().with_networks(vec![
            WifiNetwork {
                ssid: "HomeNet".to_owned(),
                signal_percent: 70,
                security: Security::Wpa2,
                in_use: false,
            },
            WifiNetwork {
                ssid: "HomeNet".to_owned(),
                signal_percent: 40,
                security: Security::Wpa2,
                in_use: false,
            },
            WifiNetwork {
                ssid: String::new(),
                signal_percent: 90,
                security: Security::Open,
                in_use: false,
            },
        ]);
        let (state, mock, _dir) = test_state(adapter).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        let response = router(state.clone(), get("/api/networks")).await.unwrap();
        let json = body_json(response).await;
        // hidden dropped, duplicate deduplicated to the strongest
        assert_eq!(json["networks"].as_array().unwrap().len(), 1);
        assert_eq!(json["networks"][0]["signal_percent"], 70);

        let scans = |mock: &MockAdapter| {
            mock.calls().iter().filter(|c| c.as_str() == "scan").count()
        };
        let before = scans(&mock);
        let _ = router(state.clone(), get("/api/networks")).await.unwrap();
        assert_eq!(scans(&mock), before, "second request hit the cache");
    }

    #[tokio::test(start_paused = true)]
    async fn probes_redirect_in_ap_mode_and_answer_otherwise() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        for path in ["/generate_204", "/hotspot-detect.html", "/library/test/success.html", "/ncsi.txt"] {
            let response = router(state.clone(), get(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::FOUND, "{} in AP mode", path);
            assert_eq!(
                response.headers()["location"],
                "http://192.168.4.1:8080/",
                "{} location",
                path
            );
        }

        // outside AP mode the OS-expected payloads are served
        state
            .store
            .update(StatePatch::state(ConnectionState::Connected))
            .await
            .unwrap();
        let response = router(state.clone(), get("/generate_204")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = router(state.clone(), get("/ncsi.txt")).await.unwrap();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"Microsoft NCSI");
        let response = router(state.clone(), get("/hotspot-detect.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn catch_all_serves_setup_or_dashboard() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        let response = router(state.clone(), get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = router(state.clone(), get("/some/unknown/path")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        state
            .store
            .update(StatePatch::state(ConnectionState::Connected))
            .await
            .unwrap();
        let response = router(state.clone(), get("/some/unknown/path")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn per_session_connect_rate_limit() {
        let (state, _mock, _dir) = test_state(MockAdapter::new()).await;
        wait_for_state(&state.store, ConnectionState::ApMode).await;

        // simulate a stuck in-flight request for the same session cookie
        state.inflight_sessions.lock().unwrap().insert("abc".to_owned());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/connect")
            .header("cookie", "session_id=abc")
            .body(Body::from(r#"{"ssid":"HomeNet","password":"hunter2hunter2"}"#))
            .unwrap();
        let response = router(state.clone(), request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
