use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quiver_common::config::Config;
use quiver_common::credentials::{Credential, CredentialFlags};
use quiver_common::error::{QuiverError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{challenge_realm, find_credential};

const USER_AGENT_STRING: &str = "quiver (Rust; +https://github.com/quiver-pm/quiver)";
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Conditional-request validators taken from the cached copy.
#[derive(Debug, Default, Clone)]
pub struct Conditional {
    pub if_modified_since: Option<String>,
    pub if_none_match: Option<String>,
}

/// Outcome of one GET.
#[derive(Debug)]
pub enum FetchResponse {
    /// 304: the cached copy is still good.
    NotModified,
    /// 2xx with a body to stream.
    Body(reqwest::Response),
}

enum AttemptError {
    /// Transport failures and 5xx; eligible for the retry budget.
    Retryable(QuiverError),
    /// TLS handshake failures; separate, larger budget.
    Ssl(QuiverError),
    Fatal(QuiverError),
}

impl AttemptError {
    fn into_inner(self) -> QuiverError {
        match self {
            AttemptError::Retryable(e) | AttemptError::Ssl(e) | AttemptError::Fatal(e) => e,
        }
    }
}

/// HTTP engine under the cache: redirects are followed manually so
/// credential scoping survives them, and retries happen here rather than
/// in callers.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    config: Arc<Config>,
}

impl Downloader {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .default_headers(headers)
            // Redirects are handled in fetch_once.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// GET `url`, following redirects and spending the retry budgets. The
    /// optional wall-clock timeout wraps the whole thing, retries included.
    pub async fn get(
        &self,
        url: &Url,
        conditional: Option<&Conditional>,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        match self.config.request_timeout {
            Some(budget) => tokio::time::timeout(budget, self.get_with_retries(url, conditional, cancel))
                .await
                .map_err(|_| QuiverError::TransportError {
                    url: url.to_string(),
                    reason: format!("request exceeded wall-clock budget of {budget:?}"),
                })?,
            None => self.get_with_retries(url, conditional, cancel).await,
        }
    }

    async fn get_with_retries(
        &self,
        url: &Url,
        conditional: Option<&Conditional>,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        let mut transport_retries = 0usize;
        let mut ssl_retries = 0usize;
        loop {
            match self.fetch_once(url, conditional, cancel).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(error @ AttemptError::Retryable(_))
                    if transport_retries < self.config.retry_count =>
                {
                    transport_retries += 1;
                    self.backoff(url, transport_retries + ssl_retries, cancel, error.into_inner())
                        .await?;
                }
                Err(error @ AttemptError::Ssl(_)) if ssl_retries < self.config.ssl_retry_count => {
                    ssl_retries += 1;
                    self.backoff(url, transport_retries + ssl_retries, cancel, error.into_inner())
                        .await?;
                }
                Err(error) => return Err(error.into_inner()),
            }
        }
    }

    async fn backoff(
        &self,
        url: &Url,
        attempt: usize,
        cancel: &CancellationToken,
        error: QuiverError,
    ) -> Result<()> {
        let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1) as u32);
        warn!(%url, %error, ?delay, "retrying after failure");
        tokio::select! {
            _ = cancel.cancelled() => Err(QuiverError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// One attempt: the manual redirect walk.
    async fn fetch_once(
        &self,
        url: &Url,
        conditional: Option<&Conditional>,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchResponse, AttemptError> {
        let mut current = url.clone();
        // The credential matched against the original host; it follows
        // redirects only when flagged `pass-on-redirect`.
        let original_credential: Option<&Credential> =
            find_credential(&self.config.credentials, url, None);
        let mut redirects = 0usize;
        let mut challenged_realm: Option<String> = None;
        let mut challenge_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(AttemptError::Fatal(QuiverError::Cancelled));
            }

            let same_host = current.host_str() == url.host_str();
            let credential = if same_host {
                find_credential(&self.config.credentials, &current, challenged_realm.as_deref())
            } else {
                // Cross-host: only a credential matching the new host, or
                // the original one when it passes on redirect.
                find_credential(&self.config.credentials, &current, challenged_realm.as_deref())
                    .or_else(|| {
                        original_credential
                            .filter(|c| c.flags.contains(CredentialFlags::PASS_ON_REDIRECT))
                    })
            };

            let mut request = self.client.get(current.clone());
            if current == *url {
                if let Some(conditional) = conditional {
                    if let Some(since) = &conditional.if_modified_since {
                        request = request.header(reqwest::header::IF_MODIFIED_SINCE, since);
                    }
                    if let Some(etag) = &conditional.if_none_match {
                        request = request.header(reqwest::header::IF_NONE_MATCH, etag);
                    }
                }
            }
            // Preemptive auth only for `auto` credentials; others wait for
            // the 401 challenge.
            let mut sent_auth = false;
            if let Some(credential) = credential {
                if credential.flags.contains(CredentialFlags::AUTO) || challenged_realm.is_some() {
                    request =
                        request.basic_auth(&credential.username, Some(&credential.password));
                    sent_auth = true;
                }
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Fatal(QuiverError::Cancelled)),
                sent = request.send() => sent.map_err(classify_send_error)?,
            };
            let status = response.status();
            debug!(url = %current, %status, "response");

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchResponse::NotModified);
            }
            if status.is_success() {
                return Ok(FetchResponse::Body(response));
            }
            if status.is_redirection() {
                redirects += 1;
                if redirects > self.config.max_redirections {
                    return Err(AttemptError::Fatal(QuiverError::TransportError {
                        url: url.to_string(),
                        reason: format!("more than {} redirects", self.config.max_redirections),
                    }));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AttemptError::Fatal(QuiverError::TransportError {
                            url: current.to_string(),
                            reason: format!("{status} without Location"),
                        })
                    })?;
                current = current.join(location).map_err(|e| {
                    AttemptError::Fatal(QuiverError::TransportError {
                        url: current.to_string(),
                        reason: format!("bad redirect target '{location}': {e}"),
                    })
                })?;
                continue;
            }
            match status {
                StatusCode::UNAUTHORIZED => {
                    if !challenge_retried && !sent_auth {
                        let realm = response
                            .headers()
                            .get(WWW_AUTHENTICATE)
                            .and_then(|v| v.to_str().ok())
                            .and_then(challenge_realm);
                        if find_credential(&self.config.credentials, &current, realm.as_deref())
                            .is_some()
                        {
                            debug!(url = %current, ?realm, "retrying with credentials after challenge");
                            challenged_realm = realm.or(Some(String::new()));
                            challenge_retried = true;
                            continue;
                        }
                    }
                    return Err(AttemptError::Fatal(QuiverError::Unauthorized {
                        url: current.to_string(),
                        status: status.as_u16(),
                    }));
                }
                StatusCode::FORBIDDEN => {
                    return Err(AttemptError::Fatal(QuiverError::Unauthorized {
                        url: current.to_string(),
                        status: status.as_u16(),
                    }))
                }
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    return Err(AttemptError::Fatal(QuiverError::NotFound(
                        current.to_string(),
                    )))
                }
                status if status.is_server_error() => {
                    return Err(AttemptError::Retryable(QuiverError::TransportError {
                        url: current.to_string(),
                        reason: format!("HTTP {status}"),
                    }))
                }
                status => {
                    return Err(AttemptError::Fatal(QuiverError::TransportError {
                        url: current.to_string(),
                        reason: format!("HTTP {status}"),
                    }))
                }
            }
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> AttemptError {
    let mut chain: Vec<String> = Vec::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&error);
    while let Some(err) = source {
        chain.push(err.to_string().to_ascii_lowercase());
        source = err.source();
    }
    let is_ssl = chain
        .iter()
        .any(|msg| msg.contains("ssl") || msg.contains("tls") || msg.contains("certificate"));
    let wrapped = QuiverError::from(error);
    if is_ssl {
        AttemptError::Ssl(wrapped)
    } else {
        AttemptError::Retryable(wrapped)
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Format a timestamp as an IMF-fixdate for `If-Modified-Since`.
pub fn http_date(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday.
    let weekday = (days + 4).rem_euclid(7) as usize;
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}

/// Days-since-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_epoch() {
        assert_eq!(http_date(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn http_date_known_instants() {
        // date -u -d @1445412480
        let t = UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        assert_eq!(http_date(t), "Wed, 21 Oct 2015 07:28:00 GMT");
        // Leap-year day.
        let t = UNIX_EPOCH + Duration::from_secs(951_782_400);
        assert_eq!(http_date(t), "Tue, 29 Feb 2000 00:00:00 GMT");
    }

    #[test]
    fn backoff_is_exponential() {
        // Base 250 ms, factor 2 per attempt.
        assert_eq!(BACKOFF_BASE * 2u32.pow(0), Duration::from_millis(250));
        assert_eq!(BACKOFF_BASE * 2u32.pow(1), Duration::from_millis(500));
        assert_eq!(BACKOFF_BASE * 2u32.pow(2), Duration::from_millis(1000));
    }
}
