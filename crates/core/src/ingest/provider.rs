use crate::config::Settings;
use crate::domain::price::Bar;
use crate::ingest::limiter::RateLimiter;
use crate::ingest::types::{parse_series_body, FetchOutcome};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const SERIES_PATH: &str = "/time_series";

// The provider's own single-day query mode is unreliable, so single-day
// lookups fetch a short descending window and filter to the exact date.
const SINGLE_DAY_WINDOW_BARS: u32 = 8;

#[async_trait::async_trait]
pub trait EodProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// True once the per-run call budget is spent. Uncapped providers
    /// (tests, ad hoc tooling) never exhaust.
    fn budget_exhausted(&self) -> bool {
        false
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome>;

    /// Most recent `bars` bars ending at `end` (or the provider's latest
    /// session when `end` is `None`), descending order on the wire.
    async fn fetch_descending(
        &self,
        symbol: &str,
        end: Option<NaiveDate>,
        bars: u32,
    ) -> Result<FetchOutcome>;

    async fn fetch_single_day(&self, symbol: &str, date: NaiveDate) -> Result<Option<Bar>> {
        let out = self
            .fetch_descending(symbol, Some(date), SINGLE_DAY_WINDOW_BARS)
            .await?;
        Ok(filter_exact_date(out.into_bars(), date))
    }
}

pub fn filter_exact_date(bars: Vec<Bar>, date: NaiveDate) -> Option<Bar> {
    bars.into_iter().find(|b| b.trade_date == date)
}

pub struct HttpEodProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    name: String,
    max_attempts: u32,
    limiter: Arc<RateLimiter>,
}

impl HttpEodProvider {
    pub fn from_settings(settings: &Settings, limiter: Arc<RateLimiter>) -> Result<Self> {
        let base_url = settings.require_provider_base_url()?.to_string();
        let api_key = settings.require_provider_api_key()?.to_string();

        let timeout_secs = std::env::var("PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let max_attempts = std::env::var("PROVIDER_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            name: settings.provider_name.clone(),
            max_attempts,
            limiter,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SERIES_PATH)
    }

    async fn request(&self, symbol: &str, params: &[(&str, String)]) -> Result<FetchOutcome> {
        let url = self.url();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await?;

            let mut query: Vec<(&str, String)> = vec![
                ("symbol", symbol.to_string()),
                ("interval", "1day".to_string()),
                ("apikey", self.api_key.clone()),
            ];
            query.extend(params.iter().cloned());

            let res = self.http.get(&url).query(&query).send().await;
            let res = match res {
                Ok(r) => r,
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(err).context("provider series request failed");
                    }
                    let backoff = backoff_with_jitter(attempt);
                    tracing::warn!(
                        attempt,
                        ?backoff,
                        symbol,
                        error = %err,
                        "provider request failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let status = res.status();
            let text = res.text().await.context("failed to read provider response")?;

            if status == StatusCode::TOO_MANY_REQUESTS {
                anyhow::ensure!(
                    attempt < self.max_attempts,
                    "provider rate limited after {attempt} attempts: {text}"
                );
                // 429 means the shared window is spent; generic backoff would
                // just burn attempts, so sleep through to the next window.
                let wait = self.limiter.secs_until_reset().max(1);
                tracing::warn!(attempt, symbol, wait_secs = wait, "provider 429; waiting for window reset");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            if status.is_server_error() {
                anyhow::ensure!(
                    attempt < self.max_attempts,
                    "provider HTTP {status} after {attempt} attempts: {text}"
                );
                let backoff = backoff_with_jitter(attempt);
                tracing::warn!(attempt, ?backoff, symbol, http_status = %status, "provider server error; retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            if !status.is_success() {
                anyhow::bail!("provider HTTP {status}: {text}");
            }

            let body = serde_json::from_str::<Value>(&text)
                .with_context(|| format!("provider response is not valid JSON: {text}"))?;
            return parse_series_body(&body);
        }
    }
}

#[async_trait::async_trait]
impl EodProvider for HttpEodProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn budget_exhausted(&self) -> bool {
        self.limiter.budget_exhausted()
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome> {
        anyhow::ensure!(start <= end, "start {start} must be <= end {end}");
        self.request(
            symbol,
            &[
                ("start_date", start.to_string()),
                ("end_date", end.to_string()),
            ],
        )
        .await
    }

    async fn fetch_descending(
        &self,
        symbol: &str,
        end: Option<NaiveDate>,
        bars: u32,
    ) -> Result<FetchOutcome> {
        let mut params: Vec<(&str, String)> = vec![
            ("outputsize", bars.to_string()),
            ("order", "DESC".to_string()),
        ];
        if let Some(end) = end {
            params.push(("end_date", end.to_string()));
        }
        self.request(symbol, &params).await
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << (attempt - 1).min(5));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, close: f64) -> Bar {
        Bar {
            trade_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            close,
            adj_close: None,
            volume: None,
            currency: None,
        }
    }

    #[test]
    fn single_day_filter_picks_exact_date_only() {
        let bars = vec![bar("2025-01-02", 10.0), bar("2025-01-03", 11.0)];
        let hit = filter_exact_date(bars.clone(), NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
        assert_eq!(hit.unwrap().close, 11.0);

        let miss = filter_exact_date(bars, NaiveDate::from_ymd_opt(2025, 1, 4).unwrap());
        assert!(miss.is_none());
    }

    #[test]
    fn backoff_grows_but_is_capped() {
        let b1 = backoff_with_jitter(1);
        let b3 = backoff_with_jitter(3);
        assert!(b1 >= Duration::from_secs(1));
        assert!(b1 < Duration::from_secs(2));
        assert!(b3 >= Duration::from_secs(4));
        assert!(backoff_with_jitter(30) <= Duration::from_secs(33));
    }

    fn test_settings(base_url: &str) -> Settings {
        Settings {
            database_url: None,
            sentry_dsn: None,
            provider_api_key: Some("test-key".to_string()),
            provider_base_url: Some(base_url.to_string()),
            provider_name: "test".to_string(),
            calls_per_window: 100,
            window_secs: 1,
            daily_call_limit: 800,
            daily_call_buffer: 25,
            probe_symbol: "SPY".to_string(),
            index_code: "TEST".to_string(),
            primary_provider: "test".to_string(),
            divergence_tolerance: 0.005,
            pipeline_state_dir: None,
        }
    }

    // Loopback server: 429 on the first request, a one-bar series after.
    async fn spawn_flaky_server() -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = hits.clone();

        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let n = server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;

                let (status, body) = if n == 0 {
                    ("429 Too Many Requests", r#"{"code":429,"message":"rate limit"}"#)
                } else {
                    (
                        "200 OK",
                        r#"{"values":[{"datetime":"2025-01-02","close":"10.0","adj_close":"10.0"}]}"#,
                    )
                };
                let resp = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });

        (addr, hits)
    }

    #[tokio::test]
    async fn rate_limited_request_retries_once_then_succeeds() {
        use std::sync::atomic::Ordering;

        let (addr, hits) = spawn_flaky_server().await;
        let settings = test_settings(&format!("http://{addr}"));
        let limiter = Arc::new(RateLimiter::new("test", 100, 1).unwrap());
        let provider = HttpEodProvider::from_settings(&settings, limiter).unwrap();

        let start = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 3).unwrap();
        let bars = provider
            .fetch_series("XYZ", start, end)
            .await
            .unwrap()
            .into_bars();

        // Exactly one retry after the 429, and the retried body is the one
        // that lands.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].trade_date, start);
        assert_eq!(bars[0].adj_close, Some(10.0));
    }
}
