//! Deliver the payload to an HTTP endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use sitrep_api::Payload;
use sitrep_core::{
    Backend, BackendError, ConfigError, ConfigKind, ConfigRegistry, Configurable, LogProducer,
};
use tracing::{Instrument, Span, debug, info, warn};
use url::Url;

use crate::format::Format;

pub const HTTP: &str = "http";

const URL: &str = "http.url";
const METHOD: &str = "http.method";
const CONTENT_TYPE: &str = "http.header.content-type";
const AUTHORIZATION: &str = "http.header.authorization";
const EXTRA_HEADERS: &str = "http.header.extra";
const TIMEOUT: &str = "http.timeout";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Sends the JSON payload in a single request
pub struct HttpBackend {
    url: String,
    method: Method,
    content_type: String,
    authorization: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    span: Span,
    target: Option<(Client, Url)>,
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new("")
    }
}

impl HttpBackend {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            content_type: Format::Json.content_type().to_string(),
            authorization: String::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            span: Span::none(),
            target: None,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = value.into();
        self
    }
}

fn parse_method(raw: &str) -> Method {
    match raw.to_ascii_uppercase().as_str() {
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        other => {
            warn!(method = other, "unsupported HTTP method, using POST");
            Method::POST
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue {
            key: EXTRA_HEADERS.to_string(),
            kind: ConfigKind::List,
            value: raw.to_string(),
        })
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        HTTP
    }

    async fn init(&mut self) -> Result<(), BackendError> {
        let url = Url::parse(&self.url).map_err(|_| ConfigError::InvalidValue {
            key: URL.to_string(),
            kind: ConfigKind::String,
            value: self.url.clone(),
        })?;
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        debug!(%url, method = %self.method, "http backend ready");
        self.target = Some((client, url));
        Ok(())
    }

    async fn write(&self, payload: &Payload) -> Result<(), BackendError> {
        let (client, url) = self.target.as_ref().ok_or(BackendError::NotInitialized)?;
        let body = Format::Json.encode(payload, false)?;

        let mut request = client
            .request(self.method.clone(), url.clone())
            .header(reqwest::header::CONTENT_TYPE, self.content_type.as_str());
        if !self.authorization.is_empty() {
            request = request.header(reqwest::header::AUTHORIZATION, self.authorization.as_str());
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .body(body)
            .send()
            .instrument(self.span.clone())
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        info!(parent: &self.span, %url, status = response.status().as_u16(), "payload posted");
        Ok(())
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }

    fn as_log_producer(&mut self) -> Option<&mut dyn LogProducer> {
        Some(self)
    }
}

impl Configurable for HttpBackend {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(URL, "", "Endpoint receiving the payload")?;
        config.define(METHOD, "POST", "HTTP method: POST or PUT")?;
        config.define(
            CONTENT_TYPE,
            Format::Json.content_type(),
            "Content-Type header of the request",
        )?;
        config.define(AUTHORIZATION, "", "Authorization header, omitted when empty")?;
        config.define(
            EXTRA_HEADERS,
            Vec::<String>::new(),
            "Additional headers as NAME=VALUE",
        )?;
        config.define(TIMEOUT, DEFAULT_TIMEOUT_SECS, "Request timeout in seconds")?;
        Ok(())
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        self.url = config.get(URL)?;
        self.method = parse_method(&config.get::<String>(METHOD)?);
        self.content_type = config.get(CONTENT_TYPE)?;
        self.authorization = config.get(AUTHORIZATION)?;
        self.headers = config
            .get::<Vec<String>>(EXTRA_HEADERS)?
            .iter()
            .map(|raw| parse_header(raw))
            .collect::<Result<_, _>>()?;
        self.timeout = Duration::from_secs(config.get(TIMEOUT)?);
        Ok(())
    }
}

impl LogProducer for HttpBackend {
    fn set_logger(&mut self, span: Span) {
        self.span = span;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct Captured {
        request_line: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// Answer exactly one request with `status` and hand back what was received
    async fn one_shot_server(status: &'static str) -> (String, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/inventory", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                let (name, value) = line.split_once(':').unwrap();
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            let length: usize = headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await.unwrap();

            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope"
            );
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            reader.get_mut().shutdown().await.unwrap();

            Captured {
                request_line: request_line.trim_end().to_string(),
                headers,
                body,
            }
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_put_with_headers() {
        let (url, server) = one_shot_server("200 OK").await;
        let mut backend = HttpBackend::new(url)
            .with_method(Method::PUT)
            .with_authorization("Bearer secret")
            .with_header("X-Site", "lab");
        backend.init().await.unwrap();
        backend.write(&Payload::default()).await.unwrap();

        let captured = server.await.unwrap();
        assert!(captured.request_line.starts_with("PUT /inventory "));
        assert_eq!(captured.header("content-type"), Some("application/json"));
        assert_eq!(captured.header("authorization"), Some("Bearer secret"));
        assert_eq!(captured.header("x-site"), Some("lab"));
        let sent: Payload = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(sent, Payload::default());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (url, server) = one_shot_server("500 Internal Server Error").await;
        let mut backend = HttpBackend::new(url);
        backend.init().await.unwrap();
        let err = backend.write(&Payload::default()).await.unwrap_err();
        match err {
            BackendError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        let captured = server.await.unwrap();
        assert!(captured.request_line.starts_with("POST "));
        assert!(captured.header("authorization").is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_init() {
        let mut backend = HttpBackend::new("not a url");
        assert!(matches!(
            backend.init().await,
            Err(BackendError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_write_before_init() {
        let backend = HttpBackend::new("http://127.0.0.1:1/");
        assert!(matches!(
            backend.write(&Payload::default()).await,
            Err(BackendError::NotInitialized)
        ));
    }

    #[test]
    fn test_options() {
        let mut backend = HttpBackend::default();
        let mut config = ConfigRegistry::new();
        backend.bind(&mut config).unwrap();
        config.set(URL, "https://inventory.example.net/in").unwrap();
        config.set(METHOD, "patch").unwrap();
        config.set(EXTRA_HEADERS, vec!["X-Team = ops".to_string()]).unwrap();
        config.set(TIMEOUT, 5u64).unwrap();
        backend.configure(&config).unwrap();

        assert_eq!(backend.method, Method::POST);
        assert_eq!(backend.headers, vec![("X-Team".to_string(), "ops".to_string())]);
        assert_eq!(backend.timeout, Duration::from_secs(5));

        config.set(METHOD, "put").unwrap();
        config.set(EXTRA_HEADERS, vec!["broken".to_string()]).unwrap();
        assert!(backend.configure(&config).is_err());
    }
}
