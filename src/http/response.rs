//! Response construction.

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::http::request::RequestContext;

/// A complete response ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutgoingResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = Bytes::from(body.into());
        response
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for OutgoingResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Fluent builder bound to the request it answers.
///
/// Nothing reaches the client until [`send`](Self::send).
pub struct ResponseBuilder<'a> {
    ctx: &'a mut RequestContext,
    response: OutgoingResponse,
}

impl<'a> ResponseBuilder<'a> {
    pub(crate) fn new(ctx: &'a mut RequestContext) -> Self {
        Self {
            ctx,
            response: OutgoingResponse::new(StatusCode::OK),
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.response.status = status;
        self
    }

    /// Set the status from a raw code. Codes outside 100..=999 are ignored.
    pub fn status_code(mut self, code: u16) -> Self {
        match StatusCode::from_u16(code) {
            Ok(status) => self.response.status = status,
            Err(_) => tracing::warn!(code, "Ignoring invalid status code"),
        }
        self
    }

    /// Append a header. Invalid names or values are logged and skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.response.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Ignoring invalid response header"),
        }
        self
    }

    /// Set the body and its content type.
    pub fn body(mut self, body: impl Into<Bytes>, content_type: &str) -> Self {
        self.response.body = body.into();
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                self.response.headers.insert(header::CONTENT_TYPE, value);
            }
            Err(_) => tracing::warn!(content_type, "Ignoring invalid content type"),
        }
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.body(text.into(), "text/plain; charset=utf-8")
    }

    pub fn html(self, html: impl Into<String>) -> Self {
        self.body(html.into(), "text/html; charset=utf-8")
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.body(bytes, "application/json"))
    }

    /// Re-dispatch the request on `path` after the handler returns.
    pub fn schedule_internal_redirect(self, path: impl Into<String>) -> Self {
        self.ctx.schedule_internal_redirect(path);
        self
    }

    /// Hand the response to the transport. Returns false if a response was
    /// already sent or the connection is gone.
    pub fn send(self) -> bool {
        self.ctx.send_response(self.response)
    }
}
