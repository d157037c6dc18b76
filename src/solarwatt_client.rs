use crate::errors::{SolarwattError, SolarwattResult};
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{redirect, Response, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SESSION_TTL: Duration = Duration::from_secs(900);
const SESSION_COOKIE: &str = "kiwisessionid";

/// REST client for the SOLARWATT Manager's OpenHAB API.
///
/// The Manager hands out its session cookie with a domain that does not always match the
/// host we connect to (plain IPs in particular), so the `kiwisessionid` value is captured
/// from the login response and attached to every request by hand.
pub struct SolarwattClient {
    host: String,
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    session_cookie: Option<String>,
    last_login: Option<Instant>,
    session_ttl: Duration,
}

impl SolarwattClient {
    pub fn new(host: &str, username: &str, password: &str) -> SolarwattResult<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(SolarwattError::Config("host must be a non-empty string".into()));
        }
        if username.trim().is_empty() {
            return Err(SolarwattError::Config(
                "username must be a non-empty string".into(),
            ));
        }
        if password.trim().is_empty() {
            return Err(SolarwattError::Config(
                "password must be a non-empty string".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| SolarwattError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            host: host.to_string(),
            base_url: base_url(host),
            username: username.trim().to_string(),
            password: password.trim().to_string(),
            client,
            session_cookie: None,
            last_login: None,
            session_ttl: SESSION_TTL,
        })
    }

    /// Overrides how long a login is trusted before logging in again
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn has_session(&self) -> bool {
        self.session_cookie.is_some()
    }

    /// Form login. Only a `kiwisessionid` cookie in the answer counts as success, the
    /// Manager happily serves its HTML shell for failed logins too.
    pub async fn login(&mut self) -> SolarwattResult<()> {
        let url = format!("{}/auth/login", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("url", "/"),
            ("submit", "Login"),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!("Login connection error for {}: {}", self.host, e);
                SolarwattError::Connectivity(format!("Login connection error: {e}"))
            })?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::SEE_OTHER {
            let text = snippet(&response.text().await.unwrap_or_default());
            error!(
                "Login failed with status {}. Response: {}. Host: {}",
                status, text, self.host
            );
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    SolarwattError::Auth(format!("Login failed ({status}): {text}"))
                }
                StatusCode::NOT_FOUND => {
                    SolarwattError::NotSolarwatt(format!("Login endpoint not found ({status})"))
                }
                _ => SolarwattError::Connectivity(format!("Login failed ({status}): {text}")),
            });
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(extract_session_cookie)
            .map(|value| format!("{SESSION_COOKIE}={value}"));
        let content_type = header_value(&response, CONTENT_TYPE);
        let location = (status == StatusCode::SEE_OTHER)
            .then(|| header_value(&response, LOCATION))
            .filter(|loc| !loc.is_empty());

        let Some(cookie) = cookie else {
            let message = format!(
                "Login did not return a {SESSION_COOKIE} cookie. Status={status}, Content-Type={}, Host={}",
                if content_type.is_empty() { "<none>" } else { &content_type },
                self.host
            );
            error!("{}", message);
            return Err(SolarwattError::Auth(message));
        };
        self.session_cookie = Some(cookie);

        if let Some(location) = location {
            // Warms up the session the way a browser would, failures here do not matter
            let target = format!("{}{}", self.base_url, location_path(&location));
            if let Err(e) = self.authorized_get(&target).await {
                debug!("Ignoring failed redirect after login to {}: {}", target, e);
            }
        }

        self.last_login = Some(Instant::now());
        debug!("Successfully logged in to {}", self.host);
        Ok(())
    }

    /// Checks whether the host looks like a SOLARWATT Manager at all
    pub async fn detect_manager(&self) -> SolarwattResult<()> {
        let url = format!("{}/logon.html", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            debug!("Manager check failed for {}: {}", self.host, e);
            SolarwattError::NotSolarwatt(format!("Manager check failed: {e}"))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SolarwattError::NotSolarwatt("logon.html not found".into()));
        }
        if status.is_success() || status.is_redirection() {
            return Ok(());
        }
        Err(SolarwattError::Connectivity(format!(
            "Unexpected logon page status: {status}"
        )))
    }

    /// Logs in and fetches the item list once
    pub async fn validate_connection(&mut self) -> SolarwattResult<()> {
        self.login().await?;
        self.get_items().await.map(|_| ())
    }

    pub async fn get_items(&mut self) -> SolarwattResult<Vec<Value>> {
        let body = self
            .get_json("/rest/items", SolarwattError::NotSolarwatt)
            .await?;
        into_array(body, "/rest/items")
    }

    pub async fn get_things(&mut self) -> SolarwattResult<Vec<Value>> {
        let body = self
            .get_json("/rest/things", SolarwattError::Protocol)
            .await?;
        into_array(body, "/rest/things")
    }

    pub async fn get_item(&mut self, item_name: &str) -> SolarwattResult<Value> {
        if item_name.trim().is_empty() {
            return Err(SolarwattError::Config(
                "item_name must be a non-empty string".into(),
            ));
        }
        self.get_json(
            &format!("/rest/items/{item_name}"),
            SolarwattError::NotSolarwatt,
        )
        .await
    }

    async fn ensure_session(&mut self) -> SolarwattResult<()> {
        let expired = self
            .last_login
            .map_or(true, |at| at.elapsed() > self.session_ttl);
        if expired || self.session_cookie.is_none() {
            self.login().await?;
        }
        Ok(())
    }

    async fn authorized_get(&self, url: &str) -> SolarwattResult<Response> {
        let mut request = self.client.get(url);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(COOKIE, cookie);
        }
        Ok(request.send().await?)
    }

    /// GET with one re-login when the Manager answers 401 or serves its login page
    async fn get_json(
        &mut self,
        path: &str,
        on_not_found: fn(String) -> SolarwattError,
    ) -> SolarwattResult<Value> {
        self.ensure_session().await?;
        let url = format!("{}{}", self.base_url, path);

        let mut response = self.authorized_get(&url).await?;
        if response.status() == StatusCode::UNAUTHORIZED || is_html(&response) {
            warn!(
                "Session rejected by {} on {} ({}), logging in again",
                self.host,
                path,
                response.status()
            );
            self.login().await?;
            response = self.authorized_get(&url).await?;
        }

        read_json(response, path, on_not_found).await
    }
}

async fn read_json(
    response: Response,
    path: &str,
    on_not_found: fn(String) -> SolarwattError,
) -> SolarwattResult<Value> {
    let status = response.status();
    if !status.is_success() {
        error!("HTTP error {} fetching {}", status, path);
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SolarwattError::Auth(format!("HTTP {status} fetching {path}"))
            }
            StatusCode::NOT_FOUND => on_not_found(format!("{path} not found")),
            _ => SolarwattError::Connectivity(format!("HTTP {status} fetching {path}")),
        });
    }

    let content_type = header_value(&response, CONTENT_TYPE);
    let body = response.text().await?;
    if !content_type.contains("json") {
        return Err(SolarwattError::Protocol(format!(
            "{path} did not return JSON. Status={status}, Content-Type={}, Snippet={}",
            if content_type.is_empty() { "<none>" } else { &content_type },
            snippet(&body)
        )));
    }
    Ok(serde_json::from_str(&body)?)
}

fn into_array(body: Value, path: &str) -> SolarwattResult<Vec<Value>> {
    match body {
        Value::Array(entries) => Ok(entries),
        other => Err(SolarwattError::Protocol(format!(
            "{path} returned {} instead of a list",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn header_value(response: &Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn is_html(response: &Response) -> bool {
    header_value(response, CONTENT_TYPE)
        .to_ascii_lowercase()
        .contains("text/html")
}

/// `http://<host>` unless the host already names a scheme
pub fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Path part of a redirect target. Absolute URLs are cut down to their path so the
/// session cookie is only ever sent to the Manager.
pub fn location_path(location: &str) -> &str {
    let Some((_, rest)) = location.split_once("://") else {
        return location;
    };
    match rest.find('/') {
        Some(index) => &rest[index..],
        None => "/",
    }
}

/// Value of the session cookie in a `Set-Cookie` header, if it carries one
pub fn extract_session_cookie(header: &str) -> Option<&str> {
    let (_, rest) = header.split_once(&format!("{SESSION_COOKIE}="))?;
    let value = rest.split(';').next()?.trim();
    (!value.is_empty()).then_some(value)
}

fn snippet(text: &str) -> String {
    text.replace(['\n', '\r'], " ").chars().take(300).collect()
}

#[cfg(test)]
mod test_solarwatt_client {
    use super::*;
    use mockito::Matcher;

    async fn login_mock(server: &mut mockito::Server, expected_calls: usize) -> mockito::Mock {
        server
            .mock("POST", "/auth/login")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "installer".into()),
                Matcher::UrlEncoded("password".into(), "secret".into()),
                Matcher::UrlEncoded("submit".into(), "Login".into()),
            ]))
            .with_status(303)
            .with_header("Set-Cookie", "kiwisessionid=abc123; Path=/; HttpOnly")
            .with_header("Location", "/")
            .expect(expected_calls)
            .create_async()
            .await
    }

    fn client_for(server: &mockito::Server) -> SolarwattClient {
        SolarwattClient::new(&server.url(), "installer", "secret").unwrap()
    }

    #[tokio::test]
    async fn test_login_and_get_items() {
        let mut server = mockito::Server::new_async().await;
        let login = login_mock(&mut server, 1).await;
        let items = server
            .mock("GET", "/rest/items")
            .match_header("cookie", "kiwisessionid=abc123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"name": "kacoinv_harmonized_power_produced", "state": "1500 W", "type": "Number:Power"},
                    {"name": "foxesshybrid_battery_1_battery_soc", "state": "87 %"}
                ]"#,
            )
            .expect(2)
            .create_async()
            .await;

        let mut client = client_for(&server);
        let first = client.get_items().await.unwrap();
        let second = client.get_items().await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["name"], "kacoinv_harmonized_power_produced");
        assert_eq!(first, second);
        assert!(client.has_session());

        // Session is reused, so only one login for two fetches
        login.assert_async().await;
        items.assert_async().await;
    }

    #[tokio::test]
    async fn test_absolute_redirect_stays_on_manager() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(303)
            .with_header("Set-Cookie", "kiwisessionid=abc123; Path=/")
            .with_header("Location", "http://karaf.local:8181/home.html")
            .create_async()
            .await;
        let home = server
            .mock("GET", "/home.html")
            .match_header("cookie", "kiwisessionid=abc123")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let mut client = client_for(&server);
        client.login().await.unwrap();

        home.assert_async().await;
        assert!(client.has_session());
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(401)
            .with_body("bad credentials")
            .create_async()
            .await;

        let mut client = client_for(&server);
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, SolarwattError::Auth(_)));
    }

    #[tokio::test]
    async fn test_login_without_cookie_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let mut client = client_for(&server);
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, SolarwattError::Auth(_)));
        assert!(!client.has_session());
    }

    #[tokio::test]
    async fn test_login_endpoint_missing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(404)
            .create_async()
            .await;

        let mut client = client_for(&server);
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, SolarwattError::NotSolarwatt(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_single_relogin() {
        let mut server = mockito::Server::new_async().await;
        let login = login_mock(&mut server, 2).await;
        let items = server
            .mock("GET", "/rest/items")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let mut client = client_for(&server);
        let err = client.get_items().await.unwrap_err();
        assert!(matches!(err, SolarwattError::Auth(_)));

        login.assert_async().await;
        items.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_session_logs_in_again() {
        let mut server = mockito::Server::new_async().await;
        let login = login_mock(&mut server, 2).await;
        server
            .mock("GET", "/rest/things")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"UID": "kiwigrid:location:1"}]"#)
            .create_async()
            .await;

        let mut client = client_for(&server).with_session_ttl(Duration::ZERO);
        client.get_things().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let things = client.get_things().await.unwrap();

        assert_eq!(things[0]["UID"], "kiwigrid:location:1");
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_json_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        login_mock(&mut server, 1).await;
        server
            .mock("GET", "/rest/items")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("maintenance")
            .create_async()
            .await;

        let mut client = client_for(&server);
        let err = client.get_items().await.unwrap_err();
        assert!(matches!(err, SolarwattError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_not_found_classification() {
        let mut server = mockito::Server::new_async().await;
        login_mock(&mut server, 1).await;
        server
            .mock("GET", "/rest/items")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/rest/things")
            .with_status(404)
            .create_async()
            .await;

        let mut client = client_for(&server);
        assert!(matches!(
            client.get_items().await.unwrap_err(),
            SolarwattError::NotSolarwatt(_)
        ));
        assert!(matches!(
            client.get_things().await.unwrap_err(),
            SolarwattError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_connectivity() {
        let mut server = mockito::Server::new_async().await;
        login_mock(&mut server, 1).await;
        server
            .mock("GET", "/rest/items")
            .with_status(503)
            .create_async()
            .await;

        let mut client = client_for(&server);
        assert!(matches!(
            client.get_items().await.unwrap_err(),
            SolarwattError::Connectivity(_)
        ));
    }

    #[tokio::test]
    async fn test_get_single_item() {
        let mut server = mockito::Server::new_async().await;
        login_mock(&mut server, 1).await;
        server
            .mock("GET", "/rest/items/grid_power")
            .with_status(200)
            .with_header("content-type", "application/json; charset=UTF-8")
            .with_body(r#"{"name": "grid_power", "state": "12 W"}"#)
            .create_async()
            .await;

        let mut client = client_for(&server);
        let item = client.get_item("grid_power").await.unwrap();
        assert_eq!(item["state"], "12 W");
        assert!(client.get_item(" ").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connectivity() {
        let mut client = SolarwattClient::new("127.0.0.1:1", "installer", "secret").unwrap();
        let err = client.get_items().await.unwrap_err();
        assert!(matches!(err, SolarwattError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_detect_manager() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/logon.html")
            .with_status(200)
            .with_body("<html></html>")
            .create_async()
            .await;
        assert!(client_for(&server).detect_manager().await.is_ok());

        let mut other = mockito::Server::new_async().await;
        other
            .mock("GET", "/logon.html")
            .with_status(404)
            .create_async()
            .await;
        assert!(matches!(
            client_for(&other).detect_manager().await.unwrap_err(),
            SolarwattError::NotSolarwatt(_)
        ));
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("192.168.1.20"), "http://192.168.1.20");
        assert_eq!(base_url("http://127.0.0.1:8080/"), "http://127.0.0.1:8080");
        assert_eq!(base_url(" https://manager.local "), "https://manager.local");
    }

    #[test]
    fn test_location_path() {
        assert_eq!(location_path("/home.html"), "/home.html");
        assert_eq!(location_path("http://karaf:8080/home.html?x=1"), "/home.html?x=1");
        assert_eq!(location_path("https://elsewhere.example"), "/");
    }

    #[test]
    fn test_extract_session_cookie() {
        assert_eq!(
            extract_session_cookie("kiwisessionid=abc; Path=/; Domain=karaf"),
            Some("abc")
        );
        assert_eq!(extract_session_cookie("other=1; kiwisessionid=xyz"), Some("xyz"));
        assert_eq!(extract_session_cookie("kiwisessionid=; Path=/"), None);
        assert_eq!(extract_session_cookie("JSESSIONID=1"), None);
    }

    #[test]
    fn test_new_rejects_empty_credentials() {
        assert!(SolarwattClient::new("", "installer", "pw").is_err());
        assert!(SolarwattClient::new("host", " ", "pw").is_err());
        assert!(SolarwattClient::new("host", "installer", "").is_err());
    }
}
