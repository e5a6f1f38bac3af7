//! `Upgrader` — the HTTP→WebSocket handshake stage (spec.md §4.5).
//!
//! The handshake *parser* itself is the external collaborator spec.md §1
//! calls out (`tokio_tungstenite::accept_hdr_async`, backed by
//! `tungstenite`'s HTTP parser); `Upgrader` is the validation layer this
//! crate owns on top of it — the three proxy hooks (`on_request`,
//! `on_host`, `on_header`) that spec.md §4.5 specifies.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

use crate::conn::Headers;
use crate::error::RippleError;

/// Result of a proxy validation: either accept, or reject with an HTTP
/// status code and reason (spec.md §4.5: "reject with HTTP 400 if empty
/// or unparseable").
pub type ProxyResult = Result<(), (u16, String)>;

type RequestProxy = Box<dyn Fn(&str) -> ProxyResult + Send + Sync>;
type HostProxy = Box<dyn Fn(&str) -> ProxyResult + Send + Sync>;
type HeaderProxy = Box<dyn Fn(&str, &str) -> ProxyResult + Send + Sync>;

/// Pure validation hooks run against the raw handshake request, observed
/// only for the duration of the call (spec.md §4.5: "must not retain the
/// slice beyond return" — in Rust this is simply the `&str` borrow's
/// lifetime, no `unsafe` needed, unlike the Go source's pointer casts).
#[derive(Default)]
pub struct Upgrader {
    on_request: Option<RequestProxy>,
    on_host: Option<HostProxy>,
    on_header: Option<HeaderProxy>,
}

impl Upgrader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> ProxyResult + Send + Sync + 'static,
    {
        self.on_request = Some(Box::new(f));
        self
    }

    pub fn on_host<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> ProxyResult + Send + Sync + 'static,
    {
        self.on_host = Some(Box::new(f));
        self
    }

    pub fn on_header<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> ProxyResult + Send + Sync + 'static,
    {
        self.on_header = Some(Box::new(f));
        self
    }

    /// Validate the handshake request, building either an accepted
    /// `Response` or a rejecting `ErrorResponse` (400). Called from
    /// inside `accept_hdr_async`'s callback on the reactor task.
    pub(crate) fn validate(&self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let uri = request.uri().to_string();
        if uri.is_empty() {
            return Err(reject(400, "empty request-uri"));
        }
        if let Some(proxy) = &self.on_request {
            if let Err((code, reason)) = proxy(&uri) {
                return Err(reject(code, &reason));
            }
        }

        let host = request
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if host.is_empty() {
            return Err(reject(400, "empty host header"));
        }
        if let Some(proxy) = &self.on_host {
            if let Err((code, reason)) = proxy(host) {
                return Err(reject(code, &reason));
            }
        }

        for (name, value) in request.headers().iter() {
            let name = name.as_str();
            let value = value.to_str().unwrap_or("");
            if name.is_empty() || value.is_empty() {
                return Err(reject(400, "empty header name or value"));
            }
            if let Some(proxy) = &self.on_header {
                if let Err((code, reason)) = proxy(name, value) {
                    return Err(reject(code, &reason));
                }
            }
        }

        Ok(response)
    }

    /// Snapshot the request's headers into the `Headers` map ConnState
    /// keeps after a successful handshake (spec.md §3 `headers`).
    pub(crate) fn snapshot_headers(request: &Request) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in request.headers().iter() {
            let value = value.to_str().unwrap_or("").to_string();
            headers.entry(name.as_str().to_string()).or_default().push(value);
        }
        headers
    }
}

fn reject(code: u16, reason: &str) -> ErrorResponse {
    http::Response::builder()
        .status(code)
        .body(Some(reason.to_string()))
        .unwrap_or_else(|_| {
            // `code` didn't parse as a valid HTTP status — fall back to a
            // plain 400, which always builds.
            http::Response::builder()
                .status(400)
                .body(Some(reason.to_string()))
                .expect("building a 400 response with a valid status never fails")
        })
}

impl From<RippleError> for (u16, String) {
    fn from(e: RippleError) -> Self {
        (400, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host_without_proxy() {
        // Exercised end-to-end in tests/echo.rs; unit-level coverage here
        // just pins the (code, reason) shape the proxies return.
        let result: ProxyResult = Err((400, "empty host".into()));
        assert_eq!(result.unwrap_err().0, 400);
    }
}
