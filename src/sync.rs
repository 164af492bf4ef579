//! API Sync Module
//!
//! Handles HTTP communication with the Lynk&Co telematics cloud.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::{Credentials, Session, UserId};
use crate::commands::CommandEnvelope;
use crate::registry::Vehicle;

pub const DEFAULT_BASE_URL: &str = "https://api.xchanger.cn";

const APP_ID: &str = "xiaokanl";
const OPERATOR_CODE: &str = "LYNKCO";
const ACCEPT_JSON: &str = "application/json;charset=UTF-8";
const LOGIN_SUCCESS: &str = "Success";

/// Operations the poll coordinator needs from the telematics cloud
#[async_trait]
pub trait TelematicsApi: Send + Sync {
    /// Log in and return a fresh session.
    async fn login(&self, credentials: &Credentials) -> Result<Session, ApiError>;

    /// Vehicles bound to the session's user.
    async fn list_vehicles(&self, session: &Session) -> Result<Vec<Vehicle>, ApiError>;

    /// Raw `data` object of the vehicle's current status.
    async fn fetch_status(&self, session: &Session, vin: &str) -> Result<Value, ApiError>;

    /// Submit a command envelope. `Ok` means the service accepted it.
    async fn send_command(
        &self,
        session: &Session,
        vin: &str,
        envelope: &CommandEnvelope,
    ) -> Result<(), ApiError>;
}

/// API client for the telematics backend
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new API client with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn login_url(&self) -> String {
        format!("{}/api/v1/user/login", self.base_url)
    }

    fn vehicles_url(&self) -> String {
        format!("{}/device_platform/user/vehicle", self.base_url)
    }

    fn status_url(&self, vin: &str) -> String {
        format!("{}/geelyTCAccess/tcservices/vehicle/status/{}", self.base_url, vin)
    }

    fn command_url(&self, vin: &str) -> String {
        format!("{}/geelyTCAccess/tcservices/vehicle/telematics/{}", self.base_url, vin)
    }
}

/// Headers carried by every call made with a session
pub fn session_headers(session: &Session) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
    headers.insert("X-APP-ID", HeaderValue::from_static(APP_ID));
    headers.insert("x-operator-code", HeaderValue::from_static(OPERATOR_CODE));
    let token = HeaderValue::from_str(&session.access_token)
        .map_err(|_| ApiError::Auth("access token is not a valid header value".into()))?;
    headers.insert(AUTHORIZATION, token);
    Ok(headers)
}

#[async_trait]
impl TelematicsApi for ApiClient {
    async fn login(&self, credentials: &Credentials) -> Result<Session, ApiError> {
        let url = self.login_url();
        debug!("Logging in at: {}", url);

        let digest = credentials.password_digest();
        let form = [
            ("password", digest.as_str()),
            ("username", credentials.username()),
        ];

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, ACCEPT_JSON)
            .header("X-APP-ID", APP_ID)
            .form(&form)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let (status, body) = read_body(response).await?;
        let session = parse_login(status, &body)?;
        info!("Logged in as user {}", session.user_id);
        Ok(session)
    }

    async fn list_vehicles(&self, session: &Session) -> Result<Vec<Vehicle>, ApiError> {
        let user_id = session.user_id.to_string();
        let response = self
            .client
            .get(self.vehicles_url())
            .headers(session_headers(session)?)
            .query(&[("id", user_id.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let (status, body) = read_body(response).await?;
        parse_vehicle_list(status, &body)
    }

    async fn fetch_status(&self, session: &Session, vin: &str) -> Result<Value, ApiError> {
        let user_id = session.user_id.to_string();
        let response = self
            .client
            .get(self.status_url(vin))
            .headers(session_headers(session)?)
            .query(&[
                ("userId", user_id.as_str()),
                ("latest", "false"),
                ("target", "more,basic"),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let (status, body) = read_body(response).await?;
        parse_status(vin, status, &body)
    }

    async fn send_command(
        &self,
        session: &Session,
        vin: &str,
        envelope: &CommandEnvelope,
    ) -> Result<(), ApiError> {
        let response = self
            .client
            .put(self.command_url(vin))
            .headers(session_headers(session)?)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let (status, body) = read_body(response).await?;
        debug!("Command response for {}: {} {}", vin, status, body);
        if status == StatusCode::OK {
            Ok(())
        } else {
            Err(ApiError::Command {
                vin: vin.to_string(),
                reason: format!("status {}", status),
            })
        }
    }
}

async fn read_body(response: Response) -> Result<(StatusCode, String), ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    Ok((status, body))
}

// Response types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    result_message: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct VehicleListResponse {
    list: Vec<Vehicle>,
}

#[derive(Deserialize)]
struct StatusResponse {
    data: Value,
}

/// Interpret a login response.
pub fn parse_login(status: StatusCode, body: &str) -> Result<Session, ApiError> {
    if status != StatusCode::OK {
        return Err(ApiError::Auth(format!("login returned status {}", status)));
    }

    let data: LoginResponse =
        serde_json::from_str(body).map_err(|e| ApiError::Auth(e.to_string()))?;

    match data.result_message.as_deref() {
        Some(LOGIN_SUCCESS) => {}
        other => {
            return Err(ApiError::Auth(format!(
                "login rejected: {}",
                other.unwrap_or("no result message")
            )))
        }
    }

    match (data.access_token, data.user_id) {
        (Some(access_token), Some(user_id)) if !access_token.is_empty() => Ok(Session {
            access_token,
            user_id,
            refresh_token: data.refresh_token,
        }),
        _ => Err(ApiError::Auth("login response is missing token or user id".into())),
    }
}

/// Interpret a vehicle list response.
pub fn parse_vehicle_list(status: StatusCode, body: &str) -> Result<Vec<Vehicle>, ApiError> {
    if status != StatusCode::OK {
        return Err(ApiError::VehicleList(format!("status {}", status)));
    }
    serde_json::from_str::<VehicleListResponse>(body)
        .map(|r| r.list)
        .map_err(|e| ApiError::VehicleList(e.to_string()))
}

/// Interpret a vehicle status response, returning its `data` object.
pub fn parse_status(vin: &str, status: StatusCode, body: &str) -> Result<Value, ApiError> {
    let fail = |reason: String| ApiError::StatusFetch {
        vin: vin.to_string(),
        reason,
    };
    if status != StatusCode::OK {
        return Err(fail(format!("status {}", status)));
    }
    let parsed: StatusResponse = serde_json::from_str(body).map_err(|e| fail(e.to_string()))?;
    if !parsed.data.is_object() {
        return Err(fail("response has no data object".into()));
    }
    Ok(parsed.data)
}

/// API errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Vehicle list unavailable: {0}")]
    VehicleList(String),

    #[error("Status fetch failed for {vin}: {reason}")]
    StatusFetch { vin: String, reason: String },

    #[error("Command rejected for {vin}: {reason}")]
    Command { vin: String, reason: String },

    #[error("Network error: {0}")]
    Transport(String),
}

/// Deserializers that accept either JSON strings or numbers for id-like fields.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandKind, CommandRequest};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn session() -> Session {
        Session {
            access_token: "token-abc".into(),
            user_id: "1001".into(),
            refresh_token: None,
        }
    }

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = ApiClient::new("https://example.test/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://example.test");
        assert_eq!(client.login_url(), "https://example.test/api/v1/user/login");
        assert_eq!(
            client.status_url("VIN1"),
            "https://example.test/geelyTCAccess/tcservices/vehicle/status/VIN1"
        );
        assert_eq!(
            client.command_url("VIN1"),
            "https://example.test/geelyTCAccess/tcservices/vehicle/telematics/VIN1"
        );
        assert_eq!(
            client.vehicles_url(),
            "https://example.test/device_platform/user/vehicle"
        );
    }

    #[test]
    fn test_session_headers() {
        let headers = session_headers(&session()).unwrap();
        assert_eq!(headers[ACCEPT], "application/json;charset=UTF-8");
        assert_eq!(headers["x-app-id"], "xiaokanl");
        assert_eq!(headers["x-operator-code"], "LYNKCO");
        assert_eq!(headers[AUTHORIZATION], "token-abc");
    }

    #[test]
    fn test_session_headers_reject_bad_token() {
        let mut s = session();
        s.access_token = "bad\ntoken".into();
        assert!(matches!(session_headers(&s), Err(ApiError::Auth(_))));
    }

    #[test]
    fn test_parse_login_success() {
        let body = json!({
            "resultMessage": "Success",
            "accessToken": "tok",
            "userId": 1001,
            "refreshToken": "ref"
        })
        .to_string();
        let session = parse_login(StatusCode::OK, &body).unwrap();
        assert_eq!(session.access_token, "tok");
        assert_eq!(session.user_id, UserId::from(1001u64));
        assert_eq!(session.refresh_token.as_deref(), Some("ref"));
    }

    #[test]
    fn test_parse_login_failures() {
        let rejected = json!({"resultMessage": "Wrong password"}).to_string();
        assert!(matches!(
            parse_login(StatusCode::OK, &rejected),
            Err(ApiError::Auth(_))
        ));
        assert!(matches!(
            parse_login(StatusCode::UNAUTHORIZED, "{}"),
            Err(ApiError::Auth(_))
        ));
        assert!(matches!(
            parse_login(StatusCode::OK, "<html>"),
            Err(ApiError::Auth(_))
        ));
        let no_token = json!({"resultMessage": "Success", "userId": "1"}).to_string();
        assert!(matches!(
            parse_login(StatusCode::OK, &no_token),
            Err(ApiError::Auth(_))
        ));
    }

    #[test]
    fn test_parse_vehicle_list() {
        let body = json!({
            "list": [
                {
                    "vin": "VIN1",
                    "plateNo": "A1",
                    "seriesName": "01",
                    "colorCode": "R",
                    "tboxPlatform": "T"
                },
                {"vin": "VIN2"}
            ]
        })
        .to_string();
        let vehicles = parse_vehicle_list(StatusCode::OK, &body).unwrap();
        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[1].vin, "VIN2");
        assert!(vehicles[1].plate_no.is_none());

        assert!(matches!(
            parse_vehicle_list(StatusCode::OK, "{}"),
            Err(ApiError::VehicleList(_))
        ));
        assert!(matches!(
            parse_vehicle_list(StatusCode::FORBIDDEN, &body),
            Err(ApiError::VehicleList(_))
        ));
    }

    #[test]
    fn test_parse_status() {
        let body = json!({"data": {"vehicleStatus": {}}}).to_string();
        let data = parse_status("VIN1", StatusCode::OK, &body).unwrap();
        assert_eq!(data, json!({"vehicleStatus": {}}));

        let err = parse_status("VIN1", StatusCode::OK, r#"{"data": null}"#).unwrap_err();
        assert!(matches!(err, ApiError::StatusFetch { ref vin, .. } if vin == "VIN1"));
        assert!(parse_status("VIN1", StatusCode::UNAUTHORIZED, &body).is_err());
    }

    /// Raw HTTP request as seen by the loopback server
    struct Captured {
        line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl Captured {
        fn parse(raw: &str) -> Self {
            let (head, body) = raw.split_once("\r\n\r\n").unwrap();
            let mut lines = head.split("\r\n");
            let line = lines.next().unwrap().to_string();
            let headers = lines
                .filter_map(|l| l.split_once(':'))
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();
            Self {
                line,
                headers,
                body: body.to_string(),
            }
        }

        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }

        fn assert_session_headers(&self) {
            assert_eq!(self.header("accept"), Some(ACCEPT_JSON));
            assert_eq!(self.header("x-app-id"), Some("xiaokanl"));
            assert_eq!(self.header("x-operator-code"), Some("LYNKCO"));
            assert_eq!(self.header("authorization"), Some("tok"));
        }
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        buf.len() >= end + 4 + length
    }

    /// Answer one request with a canned response and return what was sent.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            while !request_complete(&buf) {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            String::from_utf8(buf).unwrap()
        });
        (base_url, server)
    }

    fn wire_session() -> Session {
        Session {
            access_token: "tok".into(),
            user_id: UserId::from(7u64),
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn test_login_request_on_the_wire() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"resultMessage":"Success","accessToken":"tok","userId":7}"#,
        )
        .await;
        let client = ApiClient::new(&base_url, Duration::from_secs(5)).unwrap();
        let credentials = Credentials::new("driver@example.com", "password");

        let session = client.login(&credentials).await.unwrap();
        assert_eq!(session, wire_session());

        let request = Captured::parse(&server.await.unwrap());
        assert_eq!(request.line, "POST /api/v1/user/login HTTP/1.1");
        assert_eq!(request.header("accept"), Some(ACCEPT_JSON));
        assert_eq!(request.header("x-app-id"), Some("xiaokanl"));
        assert_eq!(
            request.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(
            request.body,
            "password=5f4dcc3b5aa765d61d8327deb882cf99&username=driver%40example.com"
        );
    }

    #[tokio::test]
    async fn test_vehicle_list_request_on_the_wire() {
        let (base_url, server) = serve_once("200 OK", r#"{"list":[{"vin":"VIN1"}]}"#).await;
        let client = ApiClient::new(&base_url, Duration::from_secs(5)).unwrap();

        let vehicles = client.list_vehicles(&wire_session()).await.unwrap();
        assert_eq!(vehicles.len(), 1);

        let request = Captured::parse(&server.await.unwrap());
        assert_eq!(request.line, "GET /device_platform/user/vehicle?id=7 HTTP/1.1");
        request.assert_session_headers();
    }

    #[tokio::test]
    async fn test_status_request_on_the_wire() {
        let (base_url, server) = serve_once("200 OK", r#"{"data":{"vehicleStatus":{}}}"#).await;
        let client = ApiClient::new(&base_url, Duration::from_secs(5)).unwrap();

        let data = client.fetch_status(&wire_session(), "VIN1").await.unwrap();
        assert_eq!(data, json!({"vehicleStatus": {}}));

        let request = Captured::parse(&server.await.unwrap());
        assert_eq!(
            request.line,
            "GET /geelyTCAccess/tcservices/vehicle/status/VIN1\
             ?userId=7&latest=false&target=more%2Cbasic HTTP/1.1"
        );
        request.assert_session_headers();
    }

    #[tokio::test]
    async fn test_command_request_on_the_wire() {
        let (base_url, server) = serve_once("200 OK", "{}").await;
        let client = ApiClient::new(&base_url, Duration::from_secs(5)).unwrap();
        let session = wire_session();
        let request = CommandRequest::new("VIN1", CommandKind::Unlock, Some(&json!(3))).unwrap();
        let envelope = request.envelope(&session.user_id, 1_700_000_000);

        client.send_command(&session, "VIN1", &envelope).await.unwrap();

        let captured = Captured::parse(&server.await.unwrap());
        assert_eq!(
            captured.line,
            "PUT /geelyTCAccess/tcservices/vehicle/telematics/VIN1 HTTP/1.1"
        );
        captured.assert_session_headers();
        assert_eq!(captured.header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_str(&captured.body).unwrap();
        assert_eq!(
            body,
            json!({
                "command": "start",
                "creator": "tc",
                "serviceId": "RDU",
                "timestamp": 1_700_000_000,
                "userId": 7,
                "serviceParameters": [{"key": "time.window", "value": 3}]
            })
        );
    }

    #[tokio::test]
    async fn test_command_rejected_on_non_200() {
        let (base_url, server) = serve_once("202 Accepted", "{}").await;
        let client = ApiClient::new(&base_url, Duration::from_secs(5)).unwrap();
        let session = wire_session();
        let request = CommandRequest::new("VIN1", CommandKind::Lock, None).unwrap();
        let envelope = request.envelope(&session.user_id, 1_700_000_000);

        let err = client.send_command(&session, "VIN1", &envelope).await.unwrap_err();
        assert!(matches!(err, ApiError::Command { ref vin, .. } if vin == "VIN1"));
        server.await.unwrap();
    }
}
