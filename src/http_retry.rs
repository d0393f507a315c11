use std::time::Duration;

use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};

/// Sends the request built by `build`, retrying on transport errors, 429 and
/// 5xx with jittered exponential backoff. Only use for idempotent requests.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> reqwest::Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt < max_attempts {
                    sleep_with_jitter(backoff).await;
                    backoff = next_backoff(backoff);
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                sleep_with_jitter(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

pub fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(Duration::from_secs(5))
}

pub async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = rand::rng().random_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_only_transient_statuses() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
        assert!(!should_retry_status(StatusCode::OK));
    }

    #[test]
    fn backoff_is_capped() {
        let mut b = Duration::from_millis(200);
        for _ in 0..10 {
            b = next_backoff(b);
        }
        assert_eq!(b, Duration::from_secs(5));
    }
}
