//! Small shared helpers.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry an async operation with exponential backoff.
///
/// Used at call sites that talk to external infrastructure (backlog store,
/// version-control host) where failures are expected to be transient. The
/// final error is returned to the caller for escalation.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = base_delay;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(op = op_name, attempt, error = %e, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns within its attempts")
}

/// Keep only the tail of a potentially huge process output.
pub(crate) fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let start = text.len() - max_bytes;
    // Don't split a UTF-8 codepoint
    let mut idx = start;
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    format!("... (truncated)\n{}", &text[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(3, Duration::from_millis(1), "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let result: Result<(), String> =
            retry_with_backoff(2, Duration::from_millis(1), "test", || async {
                Err("nope".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "nope");
    }

    #[test]
    fn tail_truncates_long_output() {
        let long = "x".repeat(100);
        let out = tail(&long, 10);
        assert!(out.len() < 40);
        assert!(out.contains("truncated"));
        assert_eq!(tail("short", 10), "short");
    }
}
