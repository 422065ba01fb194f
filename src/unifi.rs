// UniFi controller access
//
// Cookie-based sessions against the classic controller API. Each session
// owns its own HTTP client and cookie jar; logging out consumes the session,
// and a session dropped before logout releases itself in the background so
// the controller's session slots are never leaked.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use mac_address::MacAddress;
use regex::Regex;
use reqwest::StatusCode;
use secrecy::ExposeSecret as _;
use serde::{Deserialize as _, Deserializer};
use serde_derive::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::config::Credentials;
use crate::error::Error;

const LOGIN_REQUIRED: &str = "api.err.LoginRequired";

/// Unauthenticated handle on the controller.
pub struct UnifiClient {
    http: reqwest::Client,
    credentials: Arc<Credentials>,
}

/// An authenticated controller session.
pub struct Session {
    http: reqwest::Client,
    credentials: Arc<Credentials>,
    open: bool,
}

/// One station from the controller's client table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRecord {
    #[serde(default)]
    pub mac: String,
    /// Informational only, so a malformed value is dropped instead of
    /// failing the whole lookup.
    #[serde(default, deserialize_with = "string_or_none")]
    pub hostname: Option<String>,
    /// Present only while the station is associated with an access point.
    #[serde(default)]
    pub ap_mac: Option<String>,
}

impl ClientRecord {
    pub fn is_associated(&self) -> bool {
        self.ap_mac.is_some()
    }
}

fn string_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => Some(value),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct Meta {
    rc: String,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientTable {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug)]
pub enum FieldMatch {
    Exact(String),
    Pattern(Regex),
}

impl FieldMatch {
    /// Compiles `pattern` so that it only matches whole field values.
    pub fn pattern(pattern: &str) -> Result<Self, Error> {
        Ok(FieldMatch::Pattern(Regex::new(&format!("^(?:{pattern})$"))?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            FieldMatch::Exact(expected) => value == expected,
            FieldMatch::Pattern(re) => re.is_match(value),
        }
    }
}

/// Field-by-field filter over raw client records. Every term must match.
#[derive(Debug, Default)]
pub struct ClientFilter {
    terms: Vec<(String, FieldMatch)>,
}

impl ClientFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches the controller's lowercase rendering of `address`.
    pub fn mac(address: MacAddress) -> Self {
        Self::new().exact("mac", format_mac(address))
    }

    pub fn exact(mut self, field: &str, value: impl Into<String>) -> Self {
        self.terms
            .push((field.to_string(), FieldMatch::Exact(value.into())));
        self
    }

    #[allow(dead_code)]
    pub fn pattern(mut self, field: &str, pattern: &str) -> Result<Self, Error> {
        self.terms
            .push((field.to_string(), FieldMatch::pattern(pattern)?));
        Ok(self)
    }

    /// A field that is absent or not a string never matches.
    pub fn matches(&self, record: &Value) -> bool {
        self.terms.iter().all(|(field, expected)| {
            record
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|value| expected.matches(value))
        })
    }
}

pub fn format_mac(address: MacAddress) -> String {
    address.to_string().to_lowercase()
}

impl UnifiClient {
    /// Builds a client with a fresh cookie jar. Controllers ship self-signed
    /// certificates, so certificate verification is off.
    pub fn new(credentials: Arc<Credentials>, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, credentials })
    }

    /// `POST /api/login`
    ///
    /// The session cookie lands in this client's jar and is carried by the
    /// returned [`Session`].
    pub async fn login(self) -> Result<Session, Error> {
        let url = self.credentials.base_url.join("/api/login")?;
        debug!("Logging in at {}", url);

        let body = json!({
            "username": self.credentials.username,
            "password": self.credentials.password.expose_secret(),
        });

        let resp = self.http.post(url).json(&body).send().await?;

        match resp.status() {
            status if status.is_success() => {
                debug!("Login successful");
                Ok(Session {
                    http: self.http,
                    credentials: self.credentials,
                    open: true,
                })
            }
            status @ (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(Error::Authentication {
                    status: status.as_u16(),
                })
            }
            status => Err(Error::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }
}

impl Session {
    /// `GET /api/s/{site}/stat/sta`, keeping only the records that match
    /// `filter`. Order is whatever the controller returned.
    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<Vec<ClientRecord>, Error> {
        let url = self
            .credentials
            .base_url
            .join(&format!("/api/s/{}/stat/sta", self.credentials.site))?;
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::SessionExpired);
        }
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await?;
        let table: ClientTable = serde_json::from_slice(&body)?;

        if let Some(meta) = table.meta.filter(|meta| meta.rc != "ok") {
            return Err(match meta.msg {
                Some(msg) if msg == LOGIN_REQUIRED => Error::SessionExpired,
                Some(msg) => Error::Api(msg),
                None => Error::Api(format!("rc={}", meta.rc)),
            });
        }

        table
            .data
            .into_iter()
            .filter(|record| filter.matches(record))
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    /// `GET /logout`, then drops the session's HTTP client.
    pub async fn logout(mut self) -> Result<(), Error> {
        let result = send_logout(&self.http, &self.credentials.base_url).await;
        self.open = false;
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        let http = self.http.clone();
        let base_url = self.credentials.base_url.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session dropped before logout, releasing it in the background");
                handle.spawn(async move {
                    if let Err(err) = send_logout(&http, &base_url).await {
                        warn!("Background logout failed: {}", err);
                    }
                });
            }
            Err(_) => warn!("Session dropped outside the runtime; it will expire on the controller"),
        }
    }
}

async fn send_logout(http: &reqwest::Client, base_url: &Url) -> Result<(), Error> {
    let url = base_url.join("/logout")?;
    debug!("Logging out at {}", url);
    http.get(url).send().await?;
    debug!("Logout complete");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn login(server: &MockServer) -> Session {
        UnifiClient::new(credentials(server), TIMEOUT)
            .unwrap()
            .login()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_json(json!({ "username": "admin", "password": "password" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/logout"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let session = login(&server).await;
        session.logout().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "meta": { "rc": "error", "msg": "api.err.Invalid" },
                "data": []
            })))
            .mount(&server)
            .await;

        let result = UnifiClient::new(credentials(&server), TIMEOUT)
            .unwrap()
            .login()
            .await;

        assert!(
            matches!(result, Err(Error::Authentication { status: 400 })),
            "expected Authentication error"
        );
    }

    #[tokio::test]
    async fn test_login_server_error_is_not_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = UnifiClient::new(credentials(&server), TIMEOUT)
            .unwrap()
            .login()
            .await;

        match result {
            Err(err) => {
                assert!(err.is_transient());
                assert!(!err.is_auth_failure());
            }
            Ok(_) => panic!("expected login to fail"),
        }
    }

    #[tokio::test]
    async fn test_list_clients_session_expired() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/s/default/stat/sta"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "meta": { "rc": "error", "msg": "api.err.LoginRequired" },
                "data": []
            })))
            .mount(&server)
            .await;

        let session = login(&server).await;
        let result = session.list_clients(&ClientFilter::new()).await;
        session.logout().await.unwrap();

        assert!(matches!(result, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_list_clients_login_required_envelope() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/s/default/stat/sta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "meta": { "rc": "error", "msg": "api.err.LoginRequired" },
                "data": []
            })))
            .mount(&server)
            .await;

        let session = login(&server).await;
        let result = session.list_clients(&ClientFilter::new()).await;
        session.logout().await.unwrap();

        assert!(matches!(result, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn test_exact_filter_ignores_near_misses() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        mount_clients(
            &server,
            json!([
                { "mac": "aa:bb:cc:dd:ee:fe", "hostname": "near-1", "ap_mac": "00:00:00:00:00:01" },
                { "mac": "aa:bb:cc:dd:ee:ff", "hostname": "phone", "ap_mac": "00:00:00:00:00:01" },
                { "mac": "ab:bb:cc:dd:ee:ff", "hostname": "near-2" },
                { "mac": "aa:bb:cc:dd:ee:ff:00", "hostname": "near-3" }
            ]),
        )
        .await;

        let session = login(&server).await;
        let address: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let records = session.list_clients(&ClientFilter::mac(address)).await;
        session.logout().await.unwrap();

        let records = records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(records[0].hostname.as_deref(), Some("phone"));
        assert!(records[0].is_associated());
    }

    #[tokio::test]
    async fn test_odd_hostname_does_not_fail_lookup() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        mount_clients(
            &server,
            json!([{ "mac": "aa:bb:cc:dd:ee:ff", "hostname": 42, "ap_mac": "00:00:00:00:00:01" }]),
        )
        .await;

        let session = login(&server).await;
        let address: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let records = session.list_clients(&ClientFilter::mac(address)).await;
        session.logout().await.unwrap();

        let records = records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hostname, None);
        assert!(records[0].is_associated());
    }

    #[test]
    fn test_pattern_is_full_string() {
        let filter = ClientFilter::new().pattern("mac", "aa:bb:cc:dd:ee:f.").unwrap();
        assert!(filter.matches(&json!({ "mac": "aa:bb:cc:dd:ee:ff" })));
        assert!(!filter.matches(&json!({ "mac": "aa:bb:cc:dd:ee:ff:00" })));
        assert!(!filter.matches(&json!({ "mac": "0aa:bb:cc:dd:ee:ff" })));

        let filter = ClientFilter::new().pattern("hostname", "phone|tablet").unwrap();
        assert!(filter.matches(&json!({ "hostname": "tablet" })));
        assert!(!filter.matches(&json!({ "hostname": "my-phone" })));
    }

    #[test]
    fn test_filter_requires_field() {
        let filter = ClientFilter::new().exact("hostname", "phone");
        assert!(!filter.matches(&json!({ "mac": "aa:bb:cc:dd:ee:ff" })));
        assert!(!filter.matches(&json!({ "hostname": 7 })));
        assert!(ClientFilter::new().matches(&json!({})));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            ClientFilter::new().pattern("mac", "(unclosed"),
            Err(Error::Pattern(_))
        ));
    }

    #[test]
    fn test_format_mac_is_lowercase() {
        let address: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(format_mac(address), "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn test_dropped_session_logs_out() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        drop(login(&server).await);

        for _ in 0..50 {
            if count_requests(&server, "/logout").await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("dropped session was never logged out");
    }

    #[tokio::test]
    async fn test_closed_session_logs_out_once() {
        let server = MockServer::start().await;
        mount_session(&server).await;

        login(&server).await.logout().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count_requests(&server, "/logout").await, 1);
    }
}
