use crate::adb::AdbClient;
use crate::core::Result;
use regex::Regex;
use std::future::Future;
use std::time::{Duration, Instant};

/// Timeout/interval pair for a fixed-interval poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollSpec {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSpec {
    pub fn from_secs(timeout: u64, interval: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout),
            interval: Duration::from_secs(interval),
        }
    }
}

/// Invoke `predicate` until it returns true or `spec.timeout` elapses.
///
/// The predicate always runs at least once. Predicate errors propagate
/// immediately; a timeout is `Ok(false)`, not an error.
pub async fn until<F, Fut>(spec: PollSpec, mut predicate: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if predicate().await? {
            tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "condition met");
            return Ok(true);
        }
        if start.elapsed() >= spec.timeout {
            return Ok(false);
        }
        tokio::time::sleep(spec.interval).await;
    }
}

/// Poll a shell command until its output contains `pattern`.
///
/// Command failures count as "not yet" (the device may be mid-transition);
/// device-gone errors propagate.
pub async fn cmd_validate(
    client: &AdbClient,
    serial: &str,
    cmd: &[&str],
    pattern: &str,
    spec: PollSpec,
) -> Result<bool> {
    until(spec, move || async move {
        match client.try_shell(serial, cmd).await {
            Ok((_, stdout, stderr)) => Ok(stdout.contains(pattern) || stderr.contains(pattern)),
            Err(e) if e.is_device_gone() => Err(e),
            Err(_) => Ok(false),
        }
    })
    .await
}

/// Regex variant of [`cmd_validate`].
pub async fn cmd_validate_regex(
    client: &AdbClient,
    serial: &str,
    cmd: &[&str],
    pattern: &Regex,
    spec: PollSpec,
) -> Result<bool> {
    until(spec, move || async move {
        match client.try_shell(serial, cmd).await {
            Ok((_, stdout, _)) => Ok(pattern.is_match(&stdout)),
            Err(e) if e.is_device_gone() => Err(e),
            Err(_) => Ok(false),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HarnessError;
    use std::cell::Cell;

    fn quick(timeout_ms: u64, interval_ms: u64) -> PollSpec {
        PollSpec {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(interval_ms),
        }
    }

    #[tokio::test]
    async fn succeeds_once_predicate_turns_true() {
        let calls = Cell::new(0u32);
        let ok = until(quick(500, 10), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Ok(n >= 3) }
        })
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn returns_false_on_timeout() {
        let ok = until(quick(30, 10), || async { Ok(false) }).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn zero_timeout_still_runs_predicate_once() {
        let calls = Cell::new(0u32);
        let ok = until(quick(0, 10), || {
            calls.set(calls.get() + 1);
            async { Ok(false) }
        })
        .await
        .unwrap();
        assert!(!ok);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn predicate_error_propagates() {
        let err = until(quick(500, 10), || async {
            Err(HarnessError::DeviceGone("gone".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_device_gone());
    }
}
