use crate::config;
use crate::error::RemoteError;
use crate::model::{BookmarkMutation, BookmarkRecord, LanguageRecord};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const ERROR_BODY_LIMIT: usize = 200;

/// Transport boundary to the language/bookmark API. Implementations are stateless, never
/// retry, and report every failure through `RemoteError`.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_languages(&self) -> Result<Vec<LanguageRecord>, RemoteError>;

    async fn fetch_language_by_id(&self, id: &str) -> Result<LanguageRecord, RemoteError>;

    /// `user_id` is informational for the HTTP client: the server scopes the list to the
    /// bearer credential's user.
    async fn fetch_bookmarks(&self, user_id: &str) -> Result<Vec<BookmarkRecord>, RemoteError>;

    async fn add_bookmark(&self, language_id: &str) -> Result<BookmarkRecord, RemoteError>;

    async fn remove_bookmark(&self, language_id: &str) -> Result<(), RemoteError>;
}

/// Supplies the bearer credential attached to each request. Lifecycle (login, refresh,
/// storage) belongs to whoever implements this.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

impl CredentialSource for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
            timeout,
        })
    }

    pub fn from_config(cfg: &config::Remote) -> Result<Self, RemoteError> {
        let credentials = Arc::new(StaticCredential::new(cfg.token()));
        Self::new(&cfg.base_url, credentials, cfg.request_timeout())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match self.credentials.bearer_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends the request and classifies the status, error body included, inside one
    /// timeout window.
    async fn exchange(&self, builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let fut = async {
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(RemoteError::Timeout(self.timeout)),
                Err(e) => return Err(e.into()),
            };
            check_status(response).await
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RemoteError::Timeout(self.timeout))?
    }

    async fn fetch_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RemoteError> {
        let fut = async {
            let response = self.exchange(builder).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| RemoteError::Decode(crate::unpack_error(&e)))
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RemoteError::Timeout(self.timeout))?
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(RemoteError::Status(status.as_u16(), body))
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch_languages(&self) -> Result<Vec<LanguageRecord>, RemoteError> {
        self.fetch_json(self.request(Method::GET, "/api/languages")).await
    }

    async fn fetch_language_by_id(&self, id: &str) -> Result<LanguageRecord, RemoteError> {
        let path = format!("/api/languages/{}", urlencoding::encode(id));
        self.fetch_json(self.request(Method::GET, &path)).await
    }

    async fn fetch_bookmarks(&self, user_id: &str) -> Result<Vec<BookmarkRecord>, RemoteError> {
        tracing::debug!(user = user_id, "fetching bookmarks");
        self.fetch_json(self.request(Method::GET, "/api/user/bookmarks")).await
    }

    async fn add_bookmark(&self, language_id: &str) -> Result<BookmarkRecord, RemoteError> {
        let builder = self
            .request(Method::POST, "/api/user/bookmarks")
            .json(&BookmarkMutation { language_id });
        self.fetch_json(builder).await
    }

    async fn remove_bookmark(&self, language_id: &str) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::DELETE, "/api/user/bookmarks")
            .json(&BookmarkMutation { language_id });
        self.exchange(builder).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers a single request with `response` and hands back the raw request head.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn remote(base_url: &str, token: Option<&str>, timeout: Duration) -> HttpRemote {
        let credentials = Arc::new(StaticCredential::new(token.map(str::to_string)));
        HttpRemote::new(base_url, credentials, timeout).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_languages_sends_bearer_and_decodes() {
        let body = r#"[{"id":"kotlin","name":"Kotlin","ranking":5,"resources":["https://kotlinlang.org"],"images":[]}]"#;
        let (url, server) = serve_once(http_response("200 OK", body)).await;

        let languages = remote(&url, Some("jwt-123"), Duration::from_secs(5))
            .fetch_languages()
            .await
            .unwrap();

        assert_eq!(languages.len(), 1);
        assert_eq!(languages[0].id, "kotlin");
        assert_eq!(languages[0].ranking, Some(5));

        let head = server.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /api/languages "));
        assert!(head.contains("authorization: bearer jwt-123"));
    }

    #[tokio::test]
    async fn test_missing_language_is_not_found() {
        let (url, server) = serve_once(http_response("404 Not Found", r#"{"error":"missing"}"#)).await;

        let err = remote(&url, None, Duration::from_secs(5))
            .fetch_language_by_id("brainfuck")
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /api/languages/brainfuck "));
        assert!(!head.to_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn test_server_error_is_status() {
        let (url, _server) = serve_once(http_response("503 Service Unavailable", "down")).await;

        let err = remote(&url, None, Duration::from_secs(5))
            .fetch_languages()
            .await
            .unwrap_err();

        assert_eq!(err, RemoteError::Status(503, "down".into()));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let (url, _server) = serve_once(http_response("200 OK", r#"{"not":"a list"}"#)).await;

        let err = remote(&url, None, Duration::from_secs(5))
            .fetch_languages()
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Decode(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let timeout = Duration::from_millis(200);
        let err = remote(&format!("http://{}", addr), None, timeout)
            .fetch_languages()
            .await
            .unwrap_err();

        assert_eq!(err, RemoteError::Timeout(timeout));
    }

    #[tokio::test]
    async fn test_language_id_is_escaped_in_path() {
        let body = r#"{"id":"c#","name":"C#","ranking":4}"#;
        let (url, server) = serve_once(http_response("200 OK", body)).await;

        let language = remote(&url, None, Duration::from_secs(5))
            .fetch_language_by_id("c#")
            .await
            .unwrap();

        assert_eq!(language.id, "c#");
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /api/languages/c%23 "), "{}", head);
    }

    #[tokio::test]
    async fn test_stalled_error_body_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 1024];
            let _ = socket.read(&mut chunk).await;
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let timeout = Duration::from_millis(200);
        let client = remote(&format!("http://{}", addr), None, timeout);
        let result = tokio::time::timeout(Duration::from_secs(3), client.remove_bookmark("rust"))
            .await
            .expect("remove_bookmark should give up on its own");

        assert_eq!(result, Err(RemoteError::Timeout(timeout)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = remote(&format!("http://{}", addr), None, Duration::from_secs(5))
            .fetch_bookmarks("u1")
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Transport(_)));
    }
}
