//! HTTP(S) range-fetch transport.
//!
//! One pool per image: a shared `reqwest::Client` carrying the cookie jar,
//! DNS cache, and TLS session state. The public `fetch` retries
//! network-class failures with a fixed delay; validator mismatches, short
//! bodies, and rejected credentials are fatal and never retried. A separate
//! stream-once entry point makes a single attempt and hands body bytes to a
//! callback as they arrive.

use crate::error::{ConfigError, FetchError};
use crate::util::cancel::Interrupt;
use futures_util::StreamExt;
use reqwest::header;
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const TRANSPORT_TRIES: u32 = 5;
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn user_agent() -> String {
    format!("vmnetfs/{} reqwest", env!("CARGO_PKG_VERSION"))
}

/// Inputs for one ranged fetch. The byte range is `[offset, offset+length)`.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub etag: Option<&'a str>,
    /// Expected Last-Modified, epoch seconds.
    pub last_modified: Option<i64>,
    pub offset: u64,
    pub length: u64,
}

pub struct TransportPool {
    client: reqwest::Client,
}

impl TransportPool {
    /// Build the pool, seeding the cookie jar with `Set-Cookie`-style
    /// strings from the configuration.
    pub fn new(origin_url: &str, cookies: &[String]) -> Result<Self, ConfigError> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        if !cookies.is_empty() {
            let url: reqwest::Url = origin_url
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("origin url: {e}")))?;
            for cookie in cookies {
                jar.add_cookie_str(cookie, &url);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .cookie_provider(jar)
            .redirect(Policy::limited(10))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetch a byte range into `buf`, retrying network-class failures up to
    /// five times with a fixed delay.
    pub async fn fetch(
        &self,
        req: &FetchRequest<'_>,
        buf: &mut [u8],
        intr: &Interrupt,
    ) -> Result<(), FetchError> {
        debug_assert_eq!(buf.len() as u64, req.length);

        let mut last_err = None;
        for attempt in 0..TRANSPORT_TRIES {
            if attempt > 0 {
                sleep(TRANSPORT_RETRY_DELAY).await;
            }
            let mut filled = 0usize;
            let result = self
                .fetch_once(req, intr, &mut |data: &[u8]| -> std::io::Result<()> {
                    buf[filled..filled + data.len()].copy_from_slice(data);
                    filled += data.len();
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(FetchError::Network(msg)) => {
                    warn!(url = req.url, attempt, "fetch failed: {msg}");
                    last_err = Some(FetchError::Network(msg));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("retry loop exits with an error"))
    }

    /// Single-attempt streaming fetch; body bytes go to `sink` as they
    /// arrive. No retry.
    pub async fn fetch_stream_once(
        &self,
        req: &FetchRequest<'_>,
        intr: &Interrupt,
        sink: &mut (dyn FnMut(&[u8]) -> std::io::Result<()> + Send),
    ) -> Result<(), FetchError> {
        self.fetch_once(req, intr, sink).await
    }

    async fn fetch_once(
        &self,
        req: &FetchRequest<'_>,
        intr: &Interrupt,
        sink: &mut (dyn FnMut(&[u8]) -> std::io::Result<()> + Send),
    ) -> Result<(), FetchError> {
        let mut builder = self
            .client
            .get(req.url)
            .header(header::RANGE, range_header(req.offset, req.length));
        if let Some(username) = req.username {
            builder = builder.basic_auth(username, req.password);
        }

        let response = tokio::select! {
            r = builder.send() => r.map_err(classify)?,
            _ = intr.triggered() => return Err(FetchError::Interrupted),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Fatal(format!(
                "authentication rejected: {status}"
            )));
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP error {status}")));
        }

        // Redirects are followed inside the client, so these headers belong
        // to the final response, the only one the validators apply to.
        check_validators(req, &response)?;

        let mut received: u64 = 0;
        let mut body = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                c = body.next() => c,
                _ = intr.triggered() => return Err(FetchError::Interrupted),
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(FetchError::Network(format!("body read: {e}"))),
                None => break,
            };
            let take = (chunk.len() as u64).min(req.length - received) as usize;
            sink(&chunk[..take])
                .map_err(|e| FetchError::Fatal(format!("stream consumer failed: {e}")))?;
            received += take as u64;
            if take < chunk.len() {
                return Err(FetchError::Fatal(format!(
                    "server returned more than the requested {} bytes",
                    req.length
                )));
            }
        }
        if received != req.length {
            return Err(FetchError::Fatal(format!(
                "short read from server: {received}/{}",
                req.length
            )));
        }
        Ok(())
    }
}

fn range_header(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length - 1)
}

fn check_validators(req: &FetchRequest<'_>, response: &reqwest::Response) -> Result<(), FetchError> {
    if let Some(expected) = req.etag {
        let found = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok());
        match found {
            None => {
                return Err(FetchError::Fatal("server did not return ETag".into()));
            }
            Some(found) if found != expected => {
                return Err(FetchError::Fatal(format!(
                    "ETag mismatch; expected {expected}, found {found}"
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(expected) = req.last_modified {
        let found = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        match found {
            None => {
                return Err(FetchError::Fatal(
                    "couldn't read Last-Modified time".into(),
                ));
            }
            Some(found) if found != expected => {
                return Err(FetchError::Fatal(format!(
                    "timestamp mismatch; expected {expected}, found {found}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// RFC 1123 filetime to epoch seconds.
fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Fatal(err.to_string())
    } else {
        // DNS, connect, timeout, proxy, transient read/write all retry.
        FetchError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(range_header(0, 4096), "bytes=0-4095");
        assert_eq!(range_header(131072, 1), "bytes=131072-131072");
    }

    #[test]
    fn test_parse_http_date() {
        let epoch = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(epoch, 784111777);
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn test_user_agent_names_package_and_transport() {
        let ua = user_agent();
        assert!(ua.starts_with("vmnetfs/"));
        assert!(ua.ends_with("reqwest"));
    }
}
