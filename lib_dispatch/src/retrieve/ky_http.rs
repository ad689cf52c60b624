//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with exponential
//! backoff retries, bearer authentication and standardized JSON response
//! handling. The dispatch REST boundary (`dispatch_api`) is built on it.

use anyhow::Context;
use reqwest::{
    Method, Url,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap},
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::ApiError;

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with metadata about the HTTP
/// transaction, such as status code and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body. An empty 2xx body is read as JSON `null`.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Collapses the response into the typed REST outcome.
    pub fn into_result(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(ApiError::from_status(self.status, self.error_body));
        }
        self.data.ok_or(ApiError::MissingBody)
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles the base URL, the
/// authentication token and automatic retries of transient failures.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` with a 3-retry exponential backoff policy.
    ///
    /// # Arguments
    /// * `base_url` - Absolute base URL, e.g. `http://10.0.2.2:9090/`. A
    ///   missing trailing slash is added so relative paths join under it.
    /// * `auth_token` - Optional bearer token for the Authorization header.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)
            .with_context(|| format!("Invalid base URL (must be absolute): {}", base_url))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request and decodes the response.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb.
    /// * `path` - Path (and query) relative to the base URL.
    /// * `headers` - Optional additional headers for this request.
    /// * `body` - Optional serializable object sent as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, the network exchange, or
    /// decoding of a 2xx body fails. Non-2xx statuses are not errors here;
    /// they come back with `success == false` and the raw body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let raw = self.request_text(method, path, headers, body).await?;
        let data = match &raw.data {
            Some(text) => {
                let text = if text.trim().is_empty() { "null" } else { text.as_str() };
                let parsed = serde_json::from_str::<T>(text).with_context(|| {
                    format!("Decoding {} response body failed", raw.status)
                })?;
                Some(parsed)
            }
            None => None,
        };
        Ok(ApiResponse {
            data,
            error_body: raw.error_body,
            status: raw.status,
            success: raw.success,
            headers: raw.headers,
        })
    }

    /// Same as `request`, but hands back a 2xx body as raw text. Used for
    /// endpoints that answer with a plain message instead of JSON.
    pub async fn request_text<B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<String>>
    where
        B: Serialize,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        log::debug!("{} {}", method, full_url);
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let text = response.text().await?;
            Ok(ApiResponse {
                data: Some(text),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            log::warn!("HTTP {} from {}", status.as_u16(), self.base_url);
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// One canned reply: status line suffix and body.
    pub(crate) struct Canned(pub &'static str, pub String);

    /// Serves `replies` in order, one connection each, and reports every raw
    /// request it read.
    pub(crate) fn mock_server(replies: Vec<Canned>) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for Canned(status, body) in replies {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let request = read_request(&mut stream);
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        (format!("http://127.0.0.1:{}", port), rx)
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let declared = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + declared {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Echo {
        id: i64,
    }

    #[tokio::test]
    async fn success_body_is_decoded_and_bearer_sent() {
        let (base, requests) = mock_server(vec![Canned("200 OK", r#"{"id":7}"#.into())]);
        let client = ApiClient::new(&base, Some("tkn".into())).unwrap();

        let resp: ApiResponse<Echo> = client
            .request(Method::POST, "/api/things?x=1", None, Some(serde_json::json!({"a": 1})))
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.into_result().unwrap(), Echo { id: 7 });

        let raw = requests.recv().unwrap();
        assert!(raw.starts_with("POST /api/things?x=1 HTTP/1.1"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer tkn"));
        assert!(raw.ends_with(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn empty_success_body_reads_as_null() {
        let (base, _requests) = mock_server(vec![Canned("200 OK", String::new())]);
        let client = ApiClient::new(&base, None).unwrap();

        let resp: ApiResponse<()> = client
            .request(Method::POST, "api/rides/1/end", None, None::<()>)
            .await
            .unwrap();
        assert!(resp.into_result().is_ok());
    }

    #[tokio::test]
    async fn unauthorized_status_is_not_an_anyhow_error() {
        let (base, _requests) = mock_server(vec![Canned("401 Unauthorized", "expired".into())]);
        let client = ApiClient::new(&base, Some("old".into())).unwrap();

        let resp: ApiResponse<Echo> = client
            .request(Method::GET, "api/rides/card?rideId=1", None, None::<()>)
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status, 401);
        assert!(resp.into_result().unwrap_err().is_unauthorized());
    }

    #[tokio::test]
    async fn plain_text_body_is_available_raw() {
        let (base, _requests) = mock_server(vec![Canned("200 OK", "OTP verified".into())]);
        let client = ApiClient::new(&base, None).unwrap();

        let resp = client
            .request_text(Method::POST, "driver/ride/verify-otp", None, None::<()>)
            .await
            .unwrap();
        assert_eq!(resp.into_result().unwrap(), "OTP verified");
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(ApiClient::new("not/absolute", None).is_err());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = ApiClient::new("http://10.0.2.2:9090/backend", None).unwrap();
        assert_eq!(client.base_url().as_str(), "http://10.0.2.2:9090/backend/");
        assert_eq!(
            client.base_url().join("api/rides").unwrap().as_str(),
            "http://10.0.2.2:9090/backend/api/rides"
        );
    }
}
