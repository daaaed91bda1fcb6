use crate::registry::{self, Device, Registry};
use crate::wol::{self, Delivery, Sender};
use axum::extract;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::Request;
use axum::http::StatusCode;
use axum::middleware;
use axum::response;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing;
use axum::Router;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub sender: Arc<Sender>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error(transparent)]
    Wol(#[from] wol::Error),
    #[error("wake task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::Wol(wol::Error::InvalidFormat(_))
            | Self::Registry(registry::Error::InvalidMac(_)) => StatusCode::BAD_REQUEST,
            Self::Registry(registry::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Registry(registry::Error::DuplicateMac(_)) => StatusCode::CONFLICT,
            Self::Registry(registry::Error::Io(_))
            | Self::Registry(registry::Error::Json(_))
            | Self::Wol(wol::Error::Send { .. })
            | Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            response::Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
pub struct DeviceRequest {
    #[serde(default)]
    name: String,
    mac: String,
}

#[derive(Deserialize)]
pub struct WakeRequest {
    mac: String,
}

#[derive(Serialize, Debug)]
pub struct WakeResponse {
    message: String,
    // Normalized form of the address the packet was built from.
    mac: String,
    delivery: Delivery,
}

async fn index() -> impl IntoResponse {
    response::Html(include_str!("index.html"))
}

async fn varz() -> response::Result<impl IntoResponse> {
    let metrics = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&metrics)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e)).into())
}

pub async fn list_devices(state: extract::State<AppState>) -> response::Json<Vec<Device>> {
    response::Json(state.registry.list())
}

// Socket sends and registry file writes block, so they run off the async
// workers.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    ApiError: From<E>,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

pub async fn add_device(
    state: extract::State<AppState>,
    req: Result<extract::Json<DeviceRequest>, JsonRejection>,
) -> Result<(StatusCode, response::Json<Device>), ApiError> {
    let extract::Json(req) = req?;
    let registry = state.registry.clone();
    let device = blocking(move || registry.add(&req.name, &req.mac)).await?;
    info!("registered {} ({})", device.name, device.mac);
    Ok((StatusCode::CREATED, response::Json(device)))
}

pub async fn update_device(
    state: extract::State<AppState>,
    id: Result<extract::Path<i64>, PathRejection>,
    req: Result<extract::Json<DeviceRequest>, JsonRejection>,
) -> Result<response::Json<Device>, ApiError> {
    let extract::Path(id) = id?;
    let extract::Json(req) = req?;
    let registry = state.registry.clone();
    let device = blocking(move || registry.update(id, &req.name, &req.mac)).await?;
    Ok(response::Json(device))
}

pub async fn delete_device(
    state: extract::State<AppState>,
    id: Result<extract::Path<i64>, PathRejection>,
) -> Result<response::Json<serde_json::Value>, ApiError> {
    let extract::Path(id) = id?;
    let registry = state.registry.clone();
    blocking(move || registry.delete(id)).await?;
    Ok(response::Json(json!({ "message": "Device deleted" })))
}

async fn send_wake(
    sender: Arc<Sender>,
    mac: String,
) -> Result<response::Json<WakeResponse>, ApiError> {
    let (mac, delivery) = blocking(move || sender.wake(&mac)).await?;
    Ok(response::Json(WakeResponse {
        message: format!("Magic packet sent to {}", mac),
        mac: mac.to_string(),
        delivery,
    }))
}

pub async fn wake_device(
    state: extract::State<AppState>,
    id: Result<extract::Path<i64>, PathRejection>,
) -> Result<response::Json<WakeResponse>, ApiError> {
    let extract::Path(id) = id?;
    let device = state.registry.get(id)?;
    send_wake(state.sender.clone(), device.mac).await
}

pub async fn wake_mac(
    state: extract::State<AppState>,
    req: Result<extract::Json<WakeRequest>, JsonRejection>,
) -> Result<response::Json<WakeResponse>, ApiError> {
    let extract::Json(req) = req?;
    send_wake(state.sender.clone(), req.mac).await
}

async fn add_observability<B>(
    req: Request<B>,
    next: middleware::Next<B>,
) -> response::Result<Response> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = next.run(req).await;
    // POST /api/wakeup/1 200
    info!(
        "{method} {request} {status}",
        method = method,
        request = path,
        status = resp.status().as_str(),
    );
    Ok(resp)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/varz", routing::get(varz))
        .route(
            "/api/devices",
            routing::get(list_devices).post(add_device),
        )
        .route(
            "/api/devices/:id",
            routing::put(update_device).delete(delete_device),
        )
        .route("/api/wakeup/:id", routing::post(wake_device))
        .route("/api/wake", routing::post(wake_mac))
        .route_layer(middleware::from_fn(add_observability))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use crate::server::*;
    use crate::wol::noop::LogOnlyTransport;
    use crate::wol::{SendConfig, Transport};
    use axum::body::Body;
    use axum::http::header;
    use serde_json::Value;
    use std::io;
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tower::ServiceExt;

    struct UnreachableTransport;

    impl Transport for UnreachableTransport {
        fn send_connected(&self, _: SocketAddrV4, _: &[u8], _: Duration) -> io::Result<usize> {
            Err(io::ErrorKind::AddrNotAvailable.into())
        }
        fn send_unconnected(&self, _: SocketAddrV4, _: &[u8], _: Duration) -> io::Result<usize> {
            Err(io::ErrorKind::PermissionDenied.into())
        }
    }

    fn state_with(transport: Box<dyn Transport>) -> extract::State<AppState> {
        extract::State(AppState {
            registry: Arc::new(Registry::open(None).unwrap()),
            sender: Arc::new(Sender::new(transport, SendConfig::default())),
        })
    }

    fn device_json(name: &str, mac: &str) -> Result<extract::Json<DeviceRequest>, JsonRejection> {
        Ok(extract::Json(DeviceRequest {
            name: name.to_string(),
            mac: mac.to_string(),
        }))
    }

    #[tokio::test]
    async fn wake_registered_device() {
        let state = state_with(Box::new(LogOnlyTransport));
        let device = state.registry.add("desktop", "00-11-22-33-44-55").unwrap();

        let response::Json(resp) = wake_device(state.clone(), Ok(extract::Path(device.id)))
            .await
            .unwrap();
        assert_eq!(resp.message, "Magic packet sent to 00:11:22:33:44:55");
        assert_eq!(resp.delivery, Delivery::Primary);
    }

    #[tokio::test]
    async fn wake_unknown_device_is_404() {
        let state = state_with(Box::new(LogOnlyTransport));
        let resp = wake_device(state, Ok(extract::Path(7))).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wake_bad_mac_is_400() {
        let state = state_with(Box::new(LogOnlyTransport));
        let req = Ok(extract::Json(WakeRequest {
            mac: "not-a-mac".to_string(),
        }));
        let resp = wake_mac(state, req).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_broadcast_is_500() {
        let state = state_with(Box::new(UnreachableTransport));
        let req = Ok(extract::Json(WakeRequest {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
        }));
        let err = wake_mac(state, req).await.unwrap_err();
        assert!(matches!(err, ApiError::Wol(wol::Error::Send { .. })));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn add_then_list() {
        let state = state_with(Box::new(LogOnlyTransport));
        let (status, response::Json(device)) =
            add_device(state.clone(), device_json("nas", "aa:bb:cc:dd:ee:ff"))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let response::Json(devices) = list_devices(state).await;
        assert_eq!(devices, vec![device]);
    }

    #[tokio::test]
    async fn add_errors_map_to_status() {
        let state = state_with(Box::new(LogOnlyTransport));
        add_device(state.clone(), device_json("nas", "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();

        let dup = add_device(state.clone(), device_json("nas2", "AA-BB-CC-DD-EE-FF"))
            .await
            .into_response();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let bad = add_device(state, device_json("nas3", "aabbccddeeff"))
            .await
            .into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let state = state_with(Box::new(LogOnlyTransport));
        let device = state.registry.add("nas", "aa:bb:cc:dd:ee:ff").unwrap();

        let response::Json(updated) = update_device(
            state.clone(),
            Ok(extract::Path(device.id)),
            device_json("storage", "aa:bb:cc:dd:ee:ff"),
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "storage");

        let missing = update_device(
            state.clone(),
            Ok(extract::Path(99)),
            device_json("ghost", "aa:bb:cc:dd:ee:00"),
        )
        .await
        .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let deleted = delete_device(state.clone(), Ok(extract::Path(device.id)))
            .await
            .into_response();
        assert_eq!(deleted.status(), StatusCode::OK);
        assert!(state.registry.list().is_empty());
    }

    #[tokio::test]
    async fn varz_exports_metrics() {
        let resp = varz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn app_with(transport: Box<dyn Transport>) -> Router {
        router(state_with(transport).0)
    }

    #[tokio::test]
    async fn routes_register_and_wake() {
        let app = app_with(Box::new(LogOnlyTransport));
        let (status, device) = call(
            &app,
            json_request("POST", "/api/devices", r#"{"name":"nas","mac":"aa-bb-cc-dd-ee-ff"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(device["id"], 1);

        let (status, list) = call(&app, empty_request("GET", "/api/devices")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(|l| l.len()), Some(1));

        let (status, body) = call(&app, empty_request("POST", "/api/wakeup/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Magic packet sent to AA:BB:CC:DD:EE:FF");
        assert_eq!(body["delivery"], "primary");

        let (status, body) = call(
            &app,
            json_request("POST", "/api/wake", r#"{"mac":"00:11:22:33:44:55"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mac"], "00:11:22:33:44:55");
    }

    #[tokio::test]
    async fn routes_reject_bad_bodies_with_json_errors() {
        let app = app_with(Box::new(LogOnlyTransport));
        let cases = vec![
            json_request("POST", "/api/wake", "{not json"),
            json_request("POST", "/api/wake", r#"{"name":"nas"}"#),
            json_request("POST", "/api/devices", r#"{"name":"nas"}"#),
            json_request("POST", "/api/devices", r#"{"name":"nas","mac":"001122334455"}"#),
            Request::builder()
                .method("POST")
                .uri("/api/wake")
                .body(Body::from(r#"{"mac":"00:11:22:33:44:55"}"#))
                .unwrap(),
            json_request("PUT", "/api/devices/1", "[]"),
        ];
        for req in cases {
            let uri = req.uri().clone();
            let (status, body) = call(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].is_string(), "{}: {}", uri, body);
        }
    }

    #[tokio::test]
    async fn routes_map_lookup_and_send_failures() {
        let app = app_with(Box::new(LogOnlyTransport));
        let (status, body) = call(&app, empty_request("POST", "/api/wakeup/abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = call(&app, empty_request("POST", "/api/wakeup/3")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "device 3 not found");

        let (status, body) = call(&app, empty_request("DELETE", "/api/devices/3")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Device deleted");

        let app = app_with(Box::new(UnreachableTransport));
        let (status, body) = call(
            &app,
            json_request("POST", "/api/wake", r#"{"mac":"00:11:22:33:44:55"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to send magic packet"));
    }
}
