use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::error::{check_http_code, IkatsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

/// Request body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Response content, decided once from the content-type header.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
    Empty,
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub url: Url,
    pub body: Body,
}

impl RestResponse {
    pub fn json(&self) -> Result<&Value> {
        match &self.body {
            Body::Json(v) => Ok(v),
            other => Err(IkatsError::decode(format!("{} expected JSON, got {}", self.url, kind_of(other)))),
        }
    }

    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.json()?;
        serde_json::from_value(value.clone())
            .map_err(|e| IkatsError::decode(format!("{}: {}", self.url, e)))
    }

    pub fn text(&self) -> String {
        match &self.body {
            Body::Json(v) => v.to_string(),
            Body::Text(t) => t.clone(),
            Body::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Body::Empty => String::new(),
        }
    }

    pub fn check(&self, context: &str) -> Result<()> {
        check_http_code(self.status, context)
    }
}

fn kind_of(body: &Body) -> &'static str {
    match body {
        Body::Json(_) => "json",
        Body::Bytes(_) => "bytes",
        Body::Text(_) => "text",
        Body::Empty => "an empty body",
    }
}

fn decode_body(content_type: Option<&str>, bytes: Vec<u8>) -> Body {
    if bytes.is_empty() {
        return Body::Empty;
    }
    let mime = content_type
        .and_then(|c| c.split(';').next())
        .map(|c| c.trim().to_ascii_lowercase());

    match mime.as_deref() {
        Some("application/octet-stream") => Body::Bytes(bytes),
        Some(m) if m.starts_with("text/") => Body::Text(String::from_utf8_lossy(&bytes).into_owned()),
        // JSON or unspecified: keep as text if it doesn't parse
        _ => match serde_json::from_slice(&bytes) {
            Ok(v) => Body::Json(v),
            Err(_) => Body::Text(String::from_utf8_lossy(&bytes).into_owned()),
        },
    }
}

/// Builds `root/seg1/seg2/...`, percent-encoding every segment.
pub fn endpoint(root: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = root.clone();
    url.path_segments_mut()
        .map_err(|_| IkatsError::Config(format!("'{}' can't be a base URL", root)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Thin wrapper over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl RestClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ikats/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, timeout })
    }

    pub async fn send(
        &self,
        verb: Verb,
        url: Url,
        query: &[(&str, String)],
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<RestResponse> {
        debug!("{:?} {}", verb, url);

        let builder = match verb {
            Verb::Get => self.http.get(url.clone()),
            Verb::Post => self.http.post(url.clone()),
            Verb::Put => self.http.put(url.clone()),
            Verb::Delete => self.http.delete(url.clone()),
        };
        let mut builder = builder.timeout(timeout.unwrap_or(self.timeout));
        if !query.is_empty() {
            builder = builder.query(query);
        }
        builder = match payload {
            Payload::Empty => builder,
            Payload::Json(v) => builder.json(&v),
            Payload::Form(fields) => builder.form(&fields),
        };

        let resp = builder.send().await.map_err(|e| {
            error!("{:?} {} failed: {}", verb, url, e);
            IkatsError::Http(e)
        })?;

        let status = resp.status();
        let final_url = resp.url().clone();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?.to_vec();

        Ok(RestResponse {
            status,
            url: final_url,
            body: decode_body(content_type.as_deref(), bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_by_content_type() {
        assert_eq!(decode_body(Some("application/json"), b"{\"a\":1}".to_vec()), Body::Json(json!({"a": 1})));
        assert_eq!(decode_body(Some("text/plain; charset=utf-8"), b"{\"a\":1}".to_vec()), Body::Text("{\"a\":1}".into()));
        assert_eq!(decode_body(Some("application/octet-stream"), vec![1, 2]), Body::Bytes(vec![1, 2]));
        assert_eq!(decode_body(None, Vec::new()), Body::Empty);
        assert_eq!(decode_body(None, b"not json".to_vec()), Body::Text("not json".into()));
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let root = Url::parse("http://localhost:8080/datamodel-api").unwrap();
        let url = endpoint(&root, &["metadata", "ABC", "unit", "m/s 2"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/datamodel-api/metadata/ABC/unit/m%2Fs%202");

        let trailing = Url::parse("http://localhost/opentsdb/").unwrap();
        assert_eq!(endpoint(&trailing, &["api", "put"]).unwrap().path(), "/opentsdb/api/put");
    }

    #[test]
    fn test_json_on_text_body_is_decode_error() {
        let resp = RestResponse {
            status: StatusCode::OK,
            url: Url::parse("http://localhost/x").unwrap(),
            body: Body::Text("oops".into()),
        };
        assert!(resp.json().unwrap_err().is_server_error());
        assert_eq!(resp.text(), "oops");
    }
}
