//! HTTP clients against an in-process mock ESP32 and backend.

#![cfg(feature = "http")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use rs_softstart::config::BackendConfig;
use rs_softstart::hal::{BackendClient, ReqwestDeviceClient};
use rs_softstart::protocol::MotorCommand;
use rs_softstart::traits::{ApiError, CommandAudit, DeviceHttp, DeviceHttpError, WifiCredentials};

#[derive(Default)]
struct Recorded {
    configure: Vec<Value>,
    restarts: usize,
    commands: Vec<(Option<String>, Value)>,
}

type Shared = Arc<Mutex<Recorded>>;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn device_app(shared: Shared) -> Router {
    Router::new()
        .route(
            "/",
            get(|| async {
                (
                    [(header::SERVER, "esp32-httpd")],
                    "<html><title>Motor Soft Starter</title></html>",
                )
            }),
        )
        .route("/ping", get(|| async { "pong" }))
        .route(
            "/status",
            get(|| async {
                Json(json!({
                    "connected": true,
                    "ssid": "MyWiFi",
                    "ip": "192.168.1.102",
                    "signal": -48
                }))
            }),
        )
        .route(
            "/configure",
            post(
                |State(shared): State<Shared>, Json(body): Json<Value>| async move {
                    let accepted = body["ssid"] != "";
                    let message = if accepted { "restarting" } else { "ssid required" };
                    shared.lock().configure.push(body);
                    Json(json!({ "success": accepted, "message": message }))
                },
            ),
        )
        .route(
            "/restart",
            post(|State(shared): State<Shared>| async move {
                shared.lock().restarts += 1;
                StatusCode::OK
            }),
        )
        .with_state(shared)
}

fn backend_app(shared: Shared) -> Router {
    Router::new()
        .route(
            "/api/motor/command",
            post(
                |State(shared): State<Shared>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    if auth.as_deref() == Some("Bearer revoked") {
                        return StatusCode::UNAUTHORIZED;
                    }
                    shared.lock().commands.push((auth, body));
                    StatusCode::CREATED
                },
            ),
        )
        .with_state(shared)
}

#[tokio::test]
async fn device_client_speaks_the_web_api() {
    let shared = Shared::default();
    let addr = serve(device_app(Arc::clone(&shared))).await;
    let client = ReqwestDeviceClient::new(addr.port()).unwrap();
    let ip = "127.0.0.1";
    let timeout = Duration::from_secs(2);

    assert!(client.ping(ip, timeout).await);

    let reply = client.probe(ip, timeout).await.unwrap();
    assert_eq!(reply.server.as_deref(), Some("esp32-httpd"));
    assert!(reply.mentions_any(&["softstarter".to_string(), "motor".to_string()]));

    let status = client.status(ip).await.unwrap();
    assert!(status.connected);
    assert_eq!(status.ip.as_deref(), Some("192.168.1.102"));
    assert_eq!(status.signal, Some(-48));

    let credentials = WifiCredentials::new("MyWiFi", "secret").unwrap();
    let response = client.configure(ip, &credentials, timeout).await.unwrap();
    assert!(response.success);
    assert_eq!(response.message, "restarting");

    client.restart(ip).await.unwrap();

    let recorded = shared.lock();
    assert_eq!(recorded.configure.len(), 1);
    assert_eq!(recorded.configure[0]["ssid"], "MyWiFi");
    assert_eq!(recorded.configure[0]["password"], "secret");
    assert_eq!(recorded.restarts, 1);
}

#[tokio::test]
async fn device_client_reports_dead_hosts() {
    // Bind then drop so the port is closed
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = ReqwestDeviceClient::new(port).unwrap();
    assert!(!client.ping("127.0.0.1", Duration::from_millis(500)).await);
    assert!(client.probe("127.0.0.1", Duration::from_millis(500)).await.is_none());
    assert!(matches!(
        client.status("127.0.0.1").await,
        Err(DeviceHttpError::Unreachable(_))
    ));
}

#[tokio::test]
async fn backend_client_posts_commands() {
    let shared = Shared::default();
    let addr = serve(backend_app(Arc::clone(&shared))).await;
    let config = BackendConfig::default()
        .with_base_url(&format!("http://{}/", addr))
        .with_token("t0ken");
    let client = BackendClient::new(&config).unwrap();
    assert_eq!(
        client.url(),
        format!("http://{}/api/motor/command", addr)
    );

    client
        .record(&MotorCommand::soft_start([50, 100, 150, 200, 250, 254]))
        .await
        .unwrap();
    client.record(&MotorCommand::EmergencyStop).await.unwrap();

    let recorded = shared.lock();
    assert_eq!(recorded.commands.len(), 2);
    let (auth, body) = &recorded.commands[0];
    assert_eq!(auth.as_deref(), Some("Bearer t0ken"));
    assert_eq!(body["command"], "arranque6p");
    assert_eq!(body["values"], json!([50, 100, 150, 200, 250, 254]));
    assert_eq!(recorded.commands[1].1["command"], "paro");
}

#[tokio::test]
async fn backend_client_maps_rejections() {
    let shared = Shared::default();
    let addr = serve(backend_app(shared)).await;
    let config = BackendConfig::default()
        .with_base_url(&format!("http://{}", addr))
        .with_token("revoked");
    let client = BackendClient::new(&config).unwrap();

    assert!(matches!(
        client.record(&MotorCommand::ContinuousStart).await,
        Err(ApiError::Unauthorized)
    ));
}
