//! WireMock-based Solidmation cloud mocking infrastructure
//!
//! Provides a mock HTTP server that answers the login, home enumeration,
//! data packet and command endpoints the way the cloud does.

use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const LOGIN: &str = "/control/LoginPage.aspx/DoStandardLogin";
pub const ENUM_HOMES: &str = "/1.0/HomeCloudService.svc/EnumHomes";
pub const DATA_PACKET: &str = "/1.0/HomeCloudService.svc/GetDataPacket";
pub const SET_MODES: &str = "/1.0/HomeCloudCommandService.svc/HVACSetModes";

/// Mock Solidmation cloud
pub struct MockSolidmationServer {
    pub server: MockServer,
    pub base_url: String,
}

impl MockSolidmationServer {
    /// Start an empty server; mount the endpoints a test needs
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    /// Start a server with one home, one endpoint and a working login
    pub async fn with_defaults() -> Self {
        let mock = Self::start().await;
        mock.mock_login("tok-1").await;
        mock.mock_enum_homes("tok-1").await;
        mock.mock_data_packet("tok-1", 24.0).await;
        mock.mock_set_modes("tok-1").await;
        mock
    }

    pub async fn mock_login(&self, token: &str) {
        Mock::given(method("POST"))
            .and(path(LOGIN))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "d": token })))
            .mount(&self.server)
            .await;
    }

    /// Login answering `first` once, then `then` for every later attempt
    pub async fn mock_login_sequence(&self, first: &str, then: &str) {
        Mock::given(method("POST"))
            .and(path(LOGIN))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "d": first })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&self.server)
            .await;
        self.mock_login(then).await;
    }

    pub async fn mock_enum_homes(&self, token: &str) {
        Mock::given(method("POST"))
            .and(path(ENUM_HOMES))
            .and(body_partial_json(token_body(token)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "EnumHomesResult": {
                    "Homes": [
                        { "HomeID": 7, "Description": "Casa" },
                        { "HomeID": 8, "Description": "Oficina" }
                    ]
                }
            })))
            .mount(&self.server)
            .await;
    }

    /// Answer any request to `endpoint` with `status`
    pub async fn mock_status(&self, endpoint: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_data_packet(&self, token: &str, current_temp: f64) {
        Mock::given(method("POST"))
            .and(path(DATA_PACKET))
            .and(body_partial_json(json!({
                "homeID": 7,
                "timeOut": 10000,
                "token": { "Token": token }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(data_packet(current_temp)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_set_modes(&self, token: &str) {
        Mock::given(method("POST"))
            .and(path(SET_MODES))
            .and(body_partial_json(token_body(token)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&self.server)
            .await;
    }

    /// Bodies of every request received on `endpoint`
    pub async fn bodies(&self, endpoint: &str) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == endpoint)
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }
}

pub fn token_body(token: &str) -> Value {
    json!({ "token": { "Token": token } })
}

/// Data packet for home 7 holding endpoint 101 in COOL at 22 °C
pub fn data_packet(current_temp: f64) -> Value {
    json!({
        "GetDataPacketResult": {
            "Endpoints": [
                {
                    "EndpointID": 101,
                    "HomeID": 7,
                    "DeviceID": 55,
                    "Description": "Living Room",
                    "EndpointType": 20,
                    "Capabilities": 768,
                    "Parameters": "SetpointMinC=16,SetpointMaxC=31"
                }
            ],
            "Devices": [
                {
                    "DeviceID": 55,
                    "Address": "A4:CF:12:00:00:01",
                    "DeviceModel": "BGH-SIAC",
                    "FirmwareVersion": "2.1.0",
                    "IsOnline": true
                }
            ],
            "EndpointValues": [
                {
                    "EndpointID": 101,
                    "Values": [
                        { "ValueType": 13, "Value": 0 },
                        { "ValueType": 14, "Value": 1 },
                        { "ValueType": 15, "Value": 2 },
                        { "ValueType": 16, "Value": 0 },
                        { "ValueType": 20, "Value": current_temp },
                        { "ValueType": 21, "Value": 22 }
                    ]
                }
            ],
            "NewSerials": {}
        }
    })
}
