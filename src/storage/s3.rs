//! S3-compatible bucket over plain HTTP with AWS Signature Version 4.

use super::{Bucket, StorageConfig};
use crate::api::Shutdown;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const DEFAULT_REGION: &str = "us-east-1";

/// Bucket handle for an S3-compatible endpoint
pub struct S3Bucket {
    http: reqwest::Client,
    endpoint: Url,
    config: StorageConfig,
    shutdown: Shutdown,
}

impl S3Bucket {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            OperatorError::Configuration(format!("invalid s3 endpoint {}: {}", config.endpoint, e))
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            config,
            shutdown: Shutdown::never(),
        })
    }

    /// Abort in-flight requests and retries once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// URL of `bucket`/`key`; path-style or virtual-hosted per config.
    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        let encoded_key = uri_encode(key, false);
        if self.config.path_style {
            let path = if key.is_empty() {
                format!("/{}", bucket)
            } else {
                format!("/{}/{}", bucket, encoded_key)
            };
            url.set_path(&path);
        } else {
            let host = self
                .endpoint
                .host_str()
                .ok_or_else(|| OperatorError::Configuration("s3 endpoint has no host".to_string()))?;
            url.set_host(Some(&format!("{}.{}", bucket, host)))
                .map_err(|e| OperatorError::Configuration(e.to_string()))?;
            url.set_path(&format!("/{}", encoded_key));
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let attempts = self.config.max_retry_attempts.max(1);
        let started = Instant::now();
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;
        loop {
            if self.shutdown.is_triggered() {
                return Err(cancelled(&method, &url));
            }
            let outcome = tokio::select! {
                outcome = self.send_once(method.clone(), url.clone(), query, body.clone()) => outcome,
                _ = self.shutdown.triggered() => return Err(cancelled(&method, &url)),
            };
            let retryable = match &outcome {
                Ok((status, _)) => status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS,
                Err(_) => true,
            };
            if !retryable
                || attempt >= attempts
                || started.elapsed() + delay > self.config.max_elapsed
            {
                return outcome;
            }
            warn!(%method, url = %url, attempt, "s3 request failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.triggered() => return Err(cancelled(&method, &url)),
            }
            delay = (delay * 2).min(self.config.max_backoff);
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        method: Method,
        mut url: Url,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        // The wire query must match the signed canonical query byte for byte
        if !query.is_empty() {
            url.set_query(Some(&canonical_query(query)));
        }
        let now = Utc::now();
        let payload_hash = hex::encode(Sha256::digest(&body));
        let host = host_header(&url)?;
        let signer = SigV4 {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
        };
        let authorization = signer.authorization(
            method.as_str(),
            url.path(),
            query,
            &host,
            &payload_hash,
            now,
        );

        debug!(%method, url = %url, "s3 request");
        let response = self
            .http
            .request(method, url)
            .header("host", host)
            .header("x-amz-date", amz_date(now))
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        Ok((status, bytes.to_vec()))
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    async fn mk_bucket(&self, bucket: &str) -> Result<()> {
        let url = self.object_url(bucket, "")?;
        let body = if self.config.region.is_empty() || self.config.region == DEFAULT_REGION {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.config.region
            )
            .into_bytes()
        };
        let (status, response) = self.send(Method::PUT, url, &[], body).await?;
        let text = String::from_utf8_lossy(&response);
        if status.is_success() || (status == StatusCode::CONFLICT && text.contains("BucketAlreadyOwnedByYou")) {
            return Ok(());
        }
        Err(OperatorError::Storage(format!(
            "create bucket {} failed with {}: {}",
            bucket, status, text
        )))
    }

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let (status, response) = self.send(Method::PUT, url, &[], data).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(OperatorError::Storage(format!(
                "upload {}/{} failed with {}: {}",
                bucket,
                key,
                status,
                String::from_utf8_lossy(&response)
            )))
        }
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key)?;
        let (status, response) = self.send(Method::GET, url, &[], Vec::new()).await?;
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(OperatorError::NotFound(format!("{}/{}", bucket, key))),
            s => Err(OperatorError::Storage(format!(
                "download {}/{} failed with {}",
                bucket, key, s
            ))),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let url = self.object_url(bucket, "")?;
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(t) = token.as_deref() {
                query.push(("continuation-token", t));
            }
            let (status, response) = self.send(Method::GET, url, &query, Vec::new()).await?;
            if !status.is_success() {
                return Err(OperatorError::Storage(format!(
                    "list {}/{} failed with {}",
                    bucket, prefix, status
                )));
            }
            let page = ListPage::parse(&String::from_utf8_lossy(&response));
            keys.extend(page.keys);
            match page.next_token {
                Some(next) if page.truncated => token = Some(next),
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }
}

struct SigV4<'a> {
    access_key: &'a str,
    secret_key: &'a str,
    region: &'a str,
}

impl SigV4<'_> {
    fn authorization(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        host: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = amz_date(now);
        let date = now.format("%Y%m%d").to_string();
        let region = if self.region.is_empty() {
            DEFAULT_REGION
        } else {
            self.region
        };
        let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method,
            if path.is_empty() { "/" } else { path },
            canonical_query(query),
            host,
            payload_hash,
            amz_date,
            signed_headers,
            payload_hash
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac(&k_date, region.as_bytes());
        let k_service = hmac(&k_region, SERVICE.as_bytes());
        let k_signing = hmac(&k_service, b"aws4_request");
        let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        )
    }
}

/// Sorted, RFC 3986 encoded `key=value` pairs.
fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn cancelled(method: &Method, url: &Url) -> OperatorError {
    OperatorError::Cancelled(format!("shutdown during s3 {} {}", method, url))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn amz_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| OperatorError::Configuration("s3 url has no host".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// RFC 3986 encoding as SigV4 expects; `/` is kept unless `encode_slash`.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[derive(Debug, Default)]
struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

impl ListPage {
    fn parse(xml: &str) -> Self {
        Self {
            keys: tag_values(xml, "Key").map(xml_unescape).collect(),
            truncated: tag_values(xml, "IsTruncated").next() == Some("true"),
            next_token: tag_values(xml, "NextContinuationToken")
                .next()
                .map(xml_unescape),
        }
    }
}

fn tag_values<'a>(xml: &'a str, tag: &str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut rest = xml;
    std::iter::from_fn(move || {
        let start = rest.find(&open)? + open.len();
        let len = rest[start..].find(&close)?;
        let value = &rest[start..start + len];
        rest = &rest[start + len + close.len()..];
        Some(value)
    })
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
