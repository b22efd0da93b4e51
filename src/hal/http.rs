//! `reqwest` clients: the ESP32 web API and the backend audit endpoint.

use std::time::Duration;

use log::debug;
use reqwest::header::SERVER;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::BackendConfig;
use crate::protocol::MotorCommand;
use crate::traits::{
    ApiError, CommandAudit, ConfigureResponse, DeviceHttp, DeviceHttpError, DeviceStatus,
    ProbeReply, WifiCredentials,
};

/// Timeout for status and restart calls.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn device_error(e: reqwest::Error) -> DeviceHttpError {
    if e.is_timeout() {
        DeviceHttpError::Timeout
    } else if e.is_decode() {
        DeviceHttpError::Decode(e.to_string())
    } else {
        DeviceHttpError::Unreachable(e.to_string())
    }
}

// ============================================================================
// ESP32 web API
// ============================================================================

#[derive(Serialize)]
struct ConfigureRequest<'a> {
    ssid: &'a str,
    password: &'a str,
    security: &'a str,
}

/// ESP32 web API over HTTP.
#[derive(Clone, Debug)]
pub struct ReqwestDeviceClient {
    client: Client,
    port: u16,
}

impl ReqwestDeviceClient {
    /// Client for devices serving on `port`.
    pub fn new(port: u16) -> Result<Self, DeviceHttpError> {
        let client = Client::builder()
            .build()
            .map_err(|e| DeviceHttpError::Unreachable(format!("HTTP client setup: {}", e)))?;
        Ok(Self { client, port })
    }

    fn url(&self, ip: &str, path: &str) -> String {
        if self.port == 80 {
            format!("http://{}{}", ip, path)
        } else {
            format!("http://{}:{}{}", ip, self.port, path)
        }
    }
}

impl DeviceHttp for ReqwestDeviceClient {
    async fn ping(&self, ip: &str, timeout: Duration) -> bool {
        match self.client.get(self.url(ip, "/ping")).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("ping {} failed: {}", ip, e);
                false
            }
        }
    }

    async fn probe(&self, ip: &str, timeout: Duration) -> Option<ProbeReply> {
        let response = self
            .client
            .get(self.url(ip, "/"))
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        let server = response
            .headers()
            .get(SERVER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Some(ProbeReply { body, server })
    }

    async fn configure(
        &self,
        ip: &str,
        credentials: &WifiCredentials,
        timeout: Duration,
    ) -> Result<ConfigureResponse, DeviceHttpError> {
        let request = ConfigureRequest {
            ssid: &credentials.ssid,
            password: &credentials.password,
            security: &credentials.security,
        };
        let response = self
            .client
            .post(self.url(ip, "/configure"))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(device_error)?;
        if !response.status().is_success() {
            return Err(DeviceHttpError::Status(response.status().as_u16()));
        }
        response.json::<ConfigureResponse>().await.map_err(device_error)
    }

    async fn status(&self, ip: &str) -> Result<DeviceStatus, DeviceHttpError> {
        let response = self
            .client
            .get(self.url(ip, "/status"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(device_error)?;
        if !response.status().is_success() {
            return Err(DeviceHttpError::Status(response.status().as_u16()));
        }
        response.json::<DeviceStatus>().await.map_err(device_error)
    }

    async fn restart(&self, ip: &str) -> Result<(), DeviceHttpError> {
        let response = self
            .client
            .post(self.url(ip, "/restart"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(device_error)?;
        if !response.status().is_success() {
            return Err(DeviceHttpError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

// ============================================================================
// Backend audit API
// ============================================================================

#[derive(Serialize)]
struct CommandRecord<'a> {
    command: &'a str,
    values: Vec<u8>,
}

/// Records motor commands with the backend API.
#[derive(Clone, Debug)]
pub struct BackendClient {
    client: Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl BackendClient {
    /// Client posting to the configured command endpoint.
    pub fn new(config: &BackendConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::Request(format!("HTTP client setup: {}", e)))?;
        Ok(Self {
            client,
            url: config.command_url(),
            token: (!config.token.is_empty()).then(|| config.token.clone()),
            timeout: config.timeout(),
        })
    }

    /// Endpoint commands are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CommandAudit for BackendClient {
    async fn record(&self, command: &MotorCommand) -> Result<(), ApiError> {
        let body = CommandRecord {
            command: command.type_label(),
            values: command.values(),
        };
        let mut request = self.client.post(&self.url).timeout(self.timeout).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Request(e.to_string())
            }
        })?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            s => Err(ApiError::Status(s.as_u16())),
        }
    }
}
