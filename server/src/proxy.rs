//! Reverse proxy to a session's worker port: HTTP forwarding with a response transform
//! pipeline (header scrub, optional IME helper injection into HTML, gzip re-encode),
//! and a bidirectional WebSocket bridge. Workers are spawned with the full base path,
//! so request paths are forwarded unmodified.

use std::io::Write;

use axum::body::Body;
use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as UpstreamCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::Utf8Bytes as UpstreamUtf8Bytes;

use common::registry::SessionRecord;

/// Injected before the closing body tag of proxied HTML when enabled: keeps IME
/// composition (CJK input) from double-feeding xterm.js.
const IME_HELPER_SNIPPET: &str = "<script>\n(function () {\n  var composing = false;\n  document.addEventListener('compositionstart', function () { composing = true; }, true);\n  document.addEventListener('compositionend', function () { composing = false; }, true);\n  document.addEventListener('keydown', function (ev) {\n    if (composing && ev.keyCode === 229) { ev.stopPropagation(); }\n  }, true);\n})();\n</script>";

const MAX_PROXY_BODY: usize = 32 * 1024 * 1024;

/// Connection-scoped headers that must not cross the proxy in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers forwarded to the worker. Drops hop-by-hop headers plus host (the worker is
/// addressed directly), content-length (reqwest re-frames) and accept-encoding (the
/// daemon wants an identity body so it can transform it, and re-encodes itself).
pub fn scrub_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&key) || matches!(key.as_str(), "host" | "content-length" | "accept-encoding") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// True if the client's Accept-Encoding advertises gzip.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("gzip"))
}

/// Insert the IME helper before the last closing body tag (case-insensitive); HTML
/// without one gets the snippet appended.
pub fn inject_ime_helper(body: &[u8]) -> Vec<u8> {
    let lower = body.to_ascii_lowercase();
    let needle = b"</body>";
    let pos = lower
        .windows(needle.len())
        .rposition(|w| w == needle);
    let mut out = Vec::with_capacity(body.len() + IME_HELPER_SNIPPET.len());
    match pos {
        Some(i) => {
            out.extend_from_slice(&body[..i]);
            out.extend_from_slice(IME_HELPER_SNIPPET.as_bytes());
            out.extend_from_slice(&body[i..]);
        }
        None => {
            out.extend_from_slice(body);
            out.extend_from_slice(IME_HELPER_SNIPPET.as_bytes());
        }
    }
    out
}

pub fn gzip_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Re-frame a worker response for the client. Encoding/framing headers are dropped (the
/// body below is the authoritative framing); all other headers pass through with
/// multi-valued headers (cookies) preserved. HTML bodies optionally get the IME helper,
/// then gzip when the client accepts it, with content-length recomputed either way.
pub fn transform_response(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    body: Bytes,
    inject: bool,
    client_accepts_gzip: bool,
) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers {
        let key = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&key) || matches!(key.as_str(), "content-encoding" | "content-length") {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }

    let is_html = upstream_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false);

    let mut out = body;
    if is_html {
        if inject {
            out = Bytes::from(inject_ime_helper(&out));
        }
        if client_accepts_gzip {
            if let Ok(compressed) = gzip_encode(&out) {
                out = Bytes::from(compressed);
                builder = builder.header(header::CONTENT_ENCODING, "gzip");
            }
        }
    }
    builder = builder.header(header::CONTENT_LENGTH, out.len());
    builder.body(Body::from(out)).unwrap()
}

/// Forward one HTTP request to the session's worker and transform the response.
pub async fn forward_http(
    client: &reqwest::Client,
    record: &SessionRecord,
    req: Request,
    inject: bool,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("unreadable request body: {e}"))
                .into_response()
        }
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{}{}", record.port, path_and_query);
    let client_accepts_gzip = accepts_gzip(&parts.headers);

    let upstream = client
        .request(parts.method.clone(), &url)
        .headers(scrub_request_headers(&parts.headers))
        .body(body)
        .send()
        .await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("[ttymux] proxy to session '{}' failed: {e}", record.name);
            return (StatusCode::BAD_GATEWAY, format!("worker unreachable: {e}")).into_response();
        }
    };

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_GATEWAY, format!("worker body read failed: {e}"))
                .into_response()
        }
    };
    transform_response(status, &headers, body, inject, client_accepts_gzip)
}

/// Bridge an upgraded client WebSocket to the worker's WebSocket endpoint. The bridge
/// lives until either side closes; deregistering the session does not tear it down.
pub async fn bridge_websocket(
    client_socket: WebSocket,
    port: u16,
    path_and_query: String,
    protocol: Option<HeaderValue>,
) {
    let url = format!("ws://127.0.0.1:{port}{path_and_query}");
    let mut request = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("[ttymux] bad worker websocket url {url}: {e}");
            return;
        }
    };
    if let Some(proto) = protocol {
        request.headers_mut().insert("Sec-WebSocket-Protocol", proto);
    }
    let (upstream_socket, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("[ttymux] worker websocket connect failed ({url}): {e}");
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if upstream_tx.send(client_to_upstream_message(msg)).await.is_err() {
                break;
            }
        }
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(mapped) = upstream_to_client_message(msg) else {
                continue;
            };
            if client_tx.send(mapped).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

fn client_to_upstream_message(message: ClientMessage) -> UpstreamMessage {
    match message {
        ClientMessage::Text(text) => {
            UpstreamMessage::Text(UpstreamUtf8Bytes::from(text.to_string()))
        }
        ClientMessage::Binary(binary) => UpstreamMessage::Binary(binary),
        ClientMessage::Ping(payload) => UpstreamMessage::Ping(payload),
        ClientMessage::Pong(payload) => UpstreamMessage::Pong(payload),
        ClientMessage::Close(frame) => {
            let mapped = frame.map(|f| UpstreamCloseFrame {
                code: UpstreamCloseCode::from(f.code),
                reason: UpstreamUtf8Bytes::from(f.reason.to_string()),
            });
            UpstreamMessage::Close(mapped)
        }
    }
}

fn upstream_to_client_message(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(binary) => Some(ClientMessage::Binary(binary)),
        UpstreamMessage::Ping(payload) => Some(ClientMessage::Ping(payload)),
        UpstreamMessage::Pong(payload) => Some(ClientMessage::Pong(payload)),
        UpstreamMessage::Close(frame) => {
            let mapped = frame.map(|f| ClientCloseFrame {
                code: u16::from(f.code),
                reason: f.reason.to_string().into(),
            });
            Some(ClientMessage::Close(mapped))
        }
        UpstreamMessage::Frame(_) => None,
    }
}
