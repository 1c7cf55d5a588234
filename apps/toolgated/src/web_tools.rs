//! Outbound HTTP connector: `web.fetch`.
//!
//! The URL gate runs before any network activity: scheme check, loopback and
//! private-range rejection, then domain deny/allow matching. Caller headers
//! are scrubbed of credential-bearing names before the request is built, and
//! the response body is streamed against the byte cap so an unbounded
//! upstream cannot exhaust memory.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value, json};
use toolgate_core::{
    CancellationToken, FieldType, GatewayError, InputSchema, Tool, ToolContext, ToolHandler,
};
use url::Url;

use crate::config::HttpFetchConfig;

const USER_AGENT: &str = concat!("toolgate/", env!("CARGO_PKG_VERSION"));

/// Header names never forwarded from the caller.
const SCRUBBED_HEADERS: [&str; 4] = ["authorization", "cookie", "x-api-key", "api-key"];

/// Hostnames that always mean "this machine".
const LOOPBACK_HOSTS: [&str; 5] = ["localhost", "127.0.0.1", "0.0.0.0", "::1", "[::1]"];

pub fn tools(config: HttpFetchConfig) -> anyhow::Result<Vec<Tool>> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;
    Ok(vec![Tool::new(
        "web.fetch",
        "Fetch a URL from the allowed domains",
        InputSchema::new()
            .required("url", FieldType::string_len(Some(1), None), "URL to fetch")
            .optional(
                "headers",
                FieldType::object(InputSchema::new()),
                "Additional request headers",
            ),
        Arc::new(Fetch {
            config: Arc::new(config),
            client,
        }),
    )])
}

fn private_ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(10\.|172\.(1[6-9]|2\d|3[01])\.|192\.168\.|169\.254\.)")
            .expect("valid private-range pattern")
    })
}

/// `*.foo.com` and `foo.com` both match `foo.com` and any of its subdomains;
/// segment boundaries only, so `evilfoo.com` never matches `foo.com`.
fn domain_matches(entry: &str, host: &str) -> bool {
    let entry = entry.trim().to_ascii_lowercase();
    let base = entry.strip_prefix("*.").unwrap_or(&entry);
    host == base || host.ends_with(&format!(".{base}"))
}

pub(crate) fn gate_url(config: &HttpFetchConfig, raw: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(raw).map_err(|e| GatewayError::security(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GatewayError::security(format!(
                "scheme {other} is not allowed"
            )));
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::security("url has no host"))?
        .to_ascii_lowercase();

    if LOOPBACK_HOSTS.contains(&host.as_str()) {
        return Err(GatewayError::security(format!(
            "blocked internal address: {host}"
        )));
    }
    if private_ipv4_re().is_match(&host) {
        return Err(GatewayError::security(format!(
            "blocked private address: {host}"
        )));
    }
    for denied in &config.denied_domains {
        if domain_matches(denied, &host) {
            return Err(GatewayError::security(format!(
                "domain {host} is denied"
            )));
        }
    }
    if config.allowed_domains.is_empty() {
        return Err(GatewayError::security("no allowed domains configured"));
    }
    if !config
        .allowed_domains
        .iter()
        .any(|allowed| domain_matches(allowed, &host))
    {
        return Err(GatewayError::security(format!(
            "domain {host} is not in the allow list"
        )));
    }
    Ok(url)
}

pub(crate) fn scrub_headers(raw: Option<&Map<String, Value>>) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    let Some(raw) = raw else {
        return Ok(headers);
    };
    for (name, value) in raw {
        if SCRUBBED_HEADERS
            .iter()
            .any(|s| name.eq_ignore_ascii_case(s))
        {
            continue;
        }
        let Some(value) = value.as_str() else {
            return Err(GatewayError::connector(format!(
                "header {name} must be a string"
            )));
        };
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| GatewayError::connector(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::connector(format!("invalid header value for {name:?}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Response headers surfaced to the caller.
const KEPT_RESPONSE_HEADERS: [&str; 4] =
    ["content-type", "content-length", "last-modified", "etag"];

struct Fetch {
    config: Arc<HttpFetchConfig>,
    client: reqwest::Client,
}

impl Fetch {
    async fn fetch(
        &self,
        url: Url,
        headers: HeaderMap,
        cancel: CancellationToken,
    ) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| GatewayError::connector(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(GatewayError::connector(format!(
                "upstream returned {status}"
            )));
        }

        let max = self.config.max_response_bytes;
        if let Some(declared) = resp.content_length()
            && declared > max
        {
            return Err(GatewayError::max_bytes(declared as usize, max));
        }

        let final_url = resp.url().to_string();
        let mut kept = Map::new();
        for name in KEPT_RESPONSE_HEADERS {
            if let Some(value) = resp.headers().get(name)
                && let Ok(value) = value.to_str()
            {
                kept.insert(name.to_string(), json!(value));
            }
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(GatewayError::new(
                        toolgate_core::ErrorCode::Timeout,
                        "cancelled during body read",
                    ));
                }
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(bytes)) => {
                        body.extend_from_slice(&bytes);
                        if body.len() as u64 > max {
                            return Err(GatewayError::max_bytes(body.len(), max));
                        }
                    }
                    Some(Err(e)) => {
                        return Err(GatewayError::connector(format!("body read failed: {e}")));
                    }
                },
            }
        }

        Ok(json!({
            "url": final_url,
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "headers": kept,
            "body": String::from_utf8_lossy(&body),
            "size": body.len(),
        }))
    }
}

#[async_trait]
impl ToolHandler for Fetch {
    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, GatewayError> {
        let raw_url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::internal("argument url missing after validation"))?;
        let url = gate_url(&self.config, raw_url)?;
        let headers = scrub_headers(args.get("headers").and_then(|v| v.as_object()))?;

        // One wall-clock bound over the whole request including the body
        // read; the harness deadline is enforced separately.
        match tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            self.fetch(url, headers, ctx.cancel.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(self.config.timeout_ms)),
        }
    }
}
