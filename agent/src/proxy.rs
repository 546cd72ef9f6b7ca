//! Proxies one `http-request` envelope to the local server and produces
//! the matching `http-response` envelope.

use crate::error::ProxyError;
use std::time::Duration;
use tunnel_protocol::{body, Envelope, HeaderMap};

const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn method_from_str(method: &str) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET)
}

/// Client used for every local-server round trip. Redirects are disabled
/// so a 30x from the local server reaches the visitor verbatim instead of
/// being followed transparently on the agent's behalf.
pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("building the local-server reqwest client")
}

/// Sends `id`/`method`/`path`/`headers`/`body` to `http://127.0.0.1:<port>`
/// and builds the `http-response` envelope to send back, or a synthesized
/// 502 when the local server can't be reached at all.
pub async fn proxy_http_request(
    client: &reqwest::Client,
    local_port: u16,
    id: &str,
    method: &str,
    path: &str,
    mut headers: HeaderMap,
    body_b64: Option<String>,
) -> Envelope {
    headers.strip(tunnel_protocol::headers::REQUEST_HOP_BY_HOP);
    headers.remove("host");
    headers.append("Host", &format!("localhost:{}", local_port));

    let url = format!("http://127.0.0.1:{}{}", local_port, path);
    let mut req = client.request(method_from_str(method), &url).timeout(LOCAL_REQUEST_TIMEOUT);
    for (key, value) in headers.iter() {
        req = req.header(key, value);
    }
    if let Some(b64) = body_b64 {
        if let Ok(bytes) = body::decode(&b64) {
            req = req.body(bytes);
        }
    }

    match send(req).await {
        Ok((status, mut resp_headers, body)) => {
            resp_headers.strip(tunnel_protocol::headers::RESPONSE_HOP_BY_HOP);
            Envelope::HttpResponse {
                id: id.to_string(),
                status,
                headers: resp_headers,
                body: if body.is_empty() { None } else { Some(body::encode_chunked(&body)) },
            }
        }
        Err(_) => Envelope::HttpResponse {
            id: id.to_string(),
            status: 502,
            headers: HeaderMap::new(),
            body: Some(body::encode_chunked(b"Failed to connect to local port")),
        },
    }
}

async fn send(req: reqwest::RequestBuilder) -> Result<(u16, HeaderMap, Vec<u8>), ProxyError> {
    let response = req.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Connect(e)
        }
    })?;

    let status = response.status().as_u16();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers.append(name.as_str(), v);
        }
    }
    let body = response.bytes().await.map_err(ProxyError::Body)?;
    Ok((status, headers, body.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_accept_encoding_from_request_headers() {
        let mut headers = HeaderMap::new();
        headers.append("Accept-Encoding", "gzip");
        headers.append("X-Keep", "1");
        headers.strip(tunnel_protocol::headers::REQUEST_HOP_BY_HOP);
        assert!(!headers.contains("accept-encoding"));
        assert!(headers.contains("x-keep"));
    }

    #[test]
    fn overrides_host_with_local_port() {
        let mut headers = HeaderMap::new();
        headers.append("Host", "abcd.tunnel.example.dev");
        headers.remove("host");
        headers.append("Host", &format!("localhost:{}", 3000));
        assert_eq!(headers.get_first("host"), Some("localhost:3000"));
    }

    #[test]
    fn strips_content_length_from_response_headers() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "42");
        headers.append("Content-Encoding", "gzip");
        headers.append("X-Keep", "1");
        headers.strip(tunnel_protocol::headers::RESPONSE_HOP_BY_HOP);
        assert!(!headers.contains("content-length"));
        assert!(!headers.contains("content-encoding"));
        assert!(headers.contains("x-keep"));
    }

    #[test]
    fn unknown_method_falls_back_to_get() {
        assert_eq!(method_from_str("BOGUS!!"), reqwest::Method::GET);
        assert_eq!(method_from_str("POST"), reqwest::Method::POST);
    }
}
