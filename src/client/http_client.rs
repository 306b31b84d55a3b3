//! HTTP gateway to the Solidmation home cloud
//!
//! Every API call is a JSON `POST` carrying the session token in the body.
//! The token is obtained lazily on first use and renewed once when the
//! cloud stops accepting it.

use crate::client::parser::{self, DataPacketResponse, EnumHomesResponse};
use crate::client::{Device, EndpointId, EndpointValues, Gateway, Home, HomeId};
use crate::config::SolidmationConfig;
use crate::error::{GatewayError, GatewayResult, Result, SyncError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

const LOGIN_PATH: &str = "control/LoginPage.aspx/DoStandardLogin";
const ENUM_HOMES_PATH: &str = "1.0/HomeCloudService.svc/EnumHomes";
const DATA_PACKET_PATH: &str = "1.0/HomeCloudService.svc/GetDataPacket";
const SET_MODES_PATH: &str = "1.0/HomeCloudCommandService.svc/HVACSetModes";

/// Long-poll timeout the cloud honours for data packets, in milliseconds
const DATA_PACKET_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    d: Option<String>,
}

/// Solidmation cloud client
pub struct SolidmationHttpClient {
    base_url: Url,
    email: String,
    password: String,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for SolidmationHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolidmationHttpClient")
            .field("base_url", &self.base_url.as_str())
            .field("email", &self.email)
            .finish()
    }
}

impl SolidmationHttpClient {
    /// Create a client; no request is made until the first call
    pub fn new(config: &SolidmationConfig) -> Result<Self> {
        if config.email.is_empty() || config.password.is_empty() {
            return Err(SyncError::config("Missing credentials"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.resolved_base_url()?,
            email: config.email.clone(),
            password: config.password.clone(),
            client,
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    /// Exchange credentials for a session token
    pub async fn login(&self) -> GatewayResult<String> {
        let mut token = self.token.lock().await;
        let fresh = self.request_token().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    async fn request_token(&self) -> GatewayResult<String> {
        debug!("Logging in to {}", self.base_url);
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&json!({ "user": self.email, "password": self.password }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::auth(format!("Login failed: HTTP {status}")));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::unknown(format!("Malformed login response: {e}")))?;
        match body.d {
            Some(token) if !token.is_empty() => {
                info!("Logged in as {}", self.email);
                Ok(token)
            }
            _ => Err(GatewayError::auth("Invalid credentials")),
        }
    }

    /// Current token, logging in first when there is none
    async fn session_token(&self) -> GatewayResult<String> {
        let mut token = self.token.lock().await;
        if let Some(existing) = token.as_ref() {
            return Ok(existing.clone());
        }
        let fresh = self.request_token().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    /// Replace a token the cloud rejected, unless another call already did
    async fn renew_token(&self, rejected: &str) -> GatewayResult<String> {
        let mut token = self.token.lock().await;
        if let Some(existing) = token.as_ref().filter(|t| t.as_str() != rejected) {
            return Ok(existing.clone());
        }
        *token = None;
        let fresh = self.request_token().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    /// Authenticated call with one transparent re-login
    async fn call<T: DeserializeOwned>(&self, path: &str, body: Map<String, Value>) -> GatewayResult<T> {
        let token = self.session_token().await?;
        let value = match self.post(path, &body, &token).await {
            Err(GatewayError::Auth(reason)) => {
                warn!("Session rejected on {path} ({reason}), logging in again");
                let token = self.renew_token(&token).await?;
                self.post(path, &body, &token).await?
            }
            other => other?,
        };

        serde_json::from_value(value)
            .map_err(|e| GatewayError::unknown(format!("Unexpected response from {path}: {e}")))
    }

    async fn post(&self, path: &str, body: &Map<String, Value>, token: &str) -> GatewayResult<Value> {
        let mut body = body.clone();
        body.insert("token".to_string(), json!({ "Token": token }));

        let response = self.client.post(self.url(path)).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(GatewayError::auth(format!("HTTP {status}")));
        }
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                GatewayError::unknown(format!("Invalid JSON from {path} (HTTP {status}): {e}"))
            })?
        };

        if is_auth_fault(&value) {
            return Err(GatewayError::auth("Session token not accepted"));
        }
        if status.is_server_error() {
            return Err(GatewayError::network(format!("HTTP {status} from {path}")));
        }
        if !status.is_success() {
            return Err(GatewayError::rejected(format!("HTTP {status} from {path}: {text}")));
        }
        Ok(value)
    }
}

/// Fault bodies the cloud returns for an expired or unknown token
fn is_auth_fault(value: &Value) -> bool {
    value
        .get("Message")
        .and_then(Value::as_str)
        .map(|message| {
            let message = message.to_ascii_lowercase();
            message.contains("token") || message.contains("authenticat")
        })
        .unwrap_or(false)
}

fn zero_serials() -> Value {
    json!({
        "Home": 0,
        "Groups": 0,
        "Devices": 0,
        "Endpoints": 0,
        "EndpointValues": 0,
        "Scenes": 0,
        "Macros": 0,
        "Alarms": 0,
    })
}

#[async_trait]
impl Gateway for SolidmationHttpClient {
    async fn list_homes(&self) -> GatewayResult<Vec<Home>> {
        let response: EnumHomesResponse = self.call(ENUM_HOMES_PATH, Map::new()).await?;
        Ok(response.result.homes.into_iter().map(Home::from).collect())
    }

    async fn fetch_snapshot(&self, home_id: HomeId) -> GatewayResult<Vec<Device>> {
        let mut body = Map::new();
        body.insert("homeID".to_string(), json!(home_id.0));
        body.insert("serials".to_string(), zero_serials());
        body.insert("timeOut".to_string(), json!(DATA_PACKET_TIMEOUT_MS));

        let response: DataPacketResponse = self.call(DATA_PACKET_PATH, body).await?;
        let devices = parser::parse_devices(response.result, home_id);
        debug!("Home {home_id}: fetched {} endpoints", devices.len());
        Ok(devices)
    }

    async fn send_command(
        &self,
        endpoint_id: EndpointId,
        payload: &EndpointValues,
    ) -> GatewayResult<()> {
        let body = parser::command_body(endpoint_id, payload);
        let _: Value = self.call(SET_MODES_PATH, body).await?;
        Ok(())
    }
}
