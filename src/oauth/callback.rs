//! Loopback HTTP server for the OAuth redirect.
//!
//! Binds `localhost` on the first free port in 8080..=8110, serves exactly
//! one callback, and hands the extracted query parameters back to the flow.
//! The server speaks just enough HTTP/1.1 to answer a browser redirect.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::OAuthError;

/// Port range scanned for a free loopback port.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 8080..=8110;

/// How long the flow waits for the user to complete authorization.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Query parameters delivered to the redirect endpoint.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// One-shot callback server.
#[derive(Debug)]
pub struct CallbackServer {
    listener: Option<TcpListener>,
    port: u16,
}

impl CallbackServer {
    /// Bind the first free port in the scan range on `localhost`.
    pub async fn bind() -> Result<Self, OAuthError> {
        for port in PORT_RANGE {
            match TcpListener::bind(("localhost", port)).await {
                Ok(listener) => {
                    tracing::debug!(port, "oauth callback server bound");
                    return Ok(Self {
                        listener: Some(listener),
                        port,
                    });
                }
                Err(_) => continue,
            }
        }
        Err(OAuthError::BindFailed(format!(
            "no free port in {}..={}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        )))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URL registered with the authorization server.
    pub fn redirect_url(&self) -> String {
        format!("http://localhost:{}/callback", self.port)
    }

    /// Serve until the `/callback` request arrives, then return its
    /// parameters. Gives up after [`CALLBACK_TIMEOUT`] or when `cancel`
    /// fires. Requests for other paths (favicons and the like) get a 404
    /// and the wait continues.
    pub async fn wait_for_callback(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CallbackParams, OAuthError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| OAuthError::BindFailed("callback server already shut down".into()))?;

        let accept_loop = async {
            loop {
                let (mut stream, _addr) = listener
                    .accept()
                    .await
                    .map_err(|e| OAuthError::BindFailed(format!("accept failed: {e}")))?;

                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();

                match parse_request_target(&request) {
                    Some(target) if target.starts_with("/callback") => {
                        let params = parse_callback_query(&target);
                        let page = if params.error.is_some() {
                            error_page(params.error.as_deref().unwrap_or("unknown error"))
                        } else {
                            success_page()
                        };
                        let _ = write_response(&mut stream, "200 OK", &page).await;
                        return Ok(params);
                    }
                    _ => {
                        let _ = write_response(&mut stream, "404 Not Found", "not found").await;
                    }
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OAuthError::CallbackTimeout),
            result = tokio::time::timeout(CALLBACK_TIMEOUT, accept_loop) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(OAuthError::CallbackTimeout),
                }
            }
        };

        self.shutdown();
        result
    }

    /// Drop the listener. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.listener.take();
    }
}

/// Extract the request target from the HTTP request line
/// (`GET /callback?code=... HTTP/1.1`).
fn parse_request_target(request: &str) -> Option<String> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let _method = parts.next()?;
    parts.next().map(|t| t.to_string())
}

/// Pull `code`, `state` and `error` out of the callback query string.
fn parse_callback_query(target: &str) -> CallbackParams {
    let mut params = CallbackParams::default();
    let Some(query) = target.splitn(2, '?').nth(1) else {
        return params;
    };
    let pairs: HashMap<String, String> = query
        .split('&')
        .filter_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next()?;
            let value = kv.next().unwrap_or("");
            Some((
                key.to_string(),
                urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string()),
            ))
        })
        .collect();
    params.code = pairs.get("code").cloned();
    params.state = pairs.get("state").cloned();
    params.error = pairs.get("error").cloned();
    params
}

async fn write_response(
    stream: &mut tokio::net::TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn success_page() -> String {
    "<html><body><h2>Authorization complete</h2>\
     <p>You can close this window and return to the terminal.</p></body></html>"
        .to_string()
}

fn error_page(error: &str) -> String {
    format!(
        "<html><body><h2>Authorization failed</h2><p>{}</p></body></html>",
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_state() {
        let params = parse_callback_query("/callback?code=abc123&state=xyz");
        assert_eq!(params.code.as_deref(), Some("abc123"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(params.error.is_none());
    }

    #[test]
    fn parses_error_and_decodes_percent_escapes() {
        let params = parse_callback_query("/callback?error=access_denied&state=s%20t");
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.state.as_deref(), Some("s t"));
    }

    #[test]
    fn missing_query_is_empty() {
        let params = parse_callback_query("/callback");
        assert!(params.code.is_none() && params.state.is_none() && params.error.is_none());
    }

    #[test]
    fn request_target_extraction() {
        let target = parse_request_target("GET /callback?code=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(target.as_deref(), Some("/callback?code=1"));
        assert!(parse_request_target("").is_none());
    }

    #[tokio::test]
    async fn serves_one_callback_end_to_end() {
        let mut server = CallbackServer::bind().await.unwrap();
        let port = server.port();
        assert!(server.redirect_url().ends_with("/callback"));

        let cancel = CancellationToken::new();
        let client = tokio::spawn(async move {
            // Give the server a moment to enter accept().
            tokio::time::sleep(Duration::from_millis(50)).await;
            let body = reqwest::get(format!(
                "http://localhost:{port}/callback?code=the-code&state=the-state"
            ))
            .await
            .unwrap();
            assert!(body.status().is_success());
        });

        let params = server.wait_for_callback(&cancel).await.unwrap();
        assert_eq!(params.code.as_deref(), Some("the-code"));
        assert_eq!(params.state.as_deref(), Some("the-state"));
        client.await.unwrap();

        // Shutdown is idempotent.
        server.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let mut server = CallbackServer::bind().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = server.wait_for_callback(&cancel).await;
        assert!(matches!(result, Err(OAuthError::CallbackTimeout)));
    }
}
