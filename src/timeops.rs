//! Clock and timeout helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ErrorCode, FsError, FsResult, Stage};

/// Current Unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Clock-skew budget in whole seconds, rounded up and clamped to the
/// positive i64 range.
pub fn skew_seconds(skew: Duration) -> i64 {
    let secs = skew.as_secs();
    let ceil = if skew.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
    ceil.min(i64::MAX as u64) as i64
}

/// Run `fut` under an optional timeout. A zero or negative budget means no
/// timeout — the future is awaited unchanged.
pub async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> FsResult<T>
where
    F: std::future::Future<Output = FsResult<T>>,
{
    match timeout {
        Some(d) if !d.is_zero() => match tokio::time::timeout(d, fut).await {
            Ok(res) => res,
            Err(_) => Err(FsError::new(Stage::Connect, ErrorCode::Timeout)
                .with_message(format!("deadline of {}ms exceeded", d.as_millis()))),
        },
        _ => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skew_rounds_up() {
        assert_eq!(skew_seconds(Duration::ZERO), 0);
        assert_eq!(skew_seconds(Duration::from_secs(5)), 5);
        assert_eq!(skew_seconds(Duration::from_millis(1)), 1);
        assert_eq!(skew_seconds(Duration::from_millis(5001)), 6);
    }

    #[tokio::test]
    async fn zero_timeout_means_none() {
        let out = with_timeout(Some(Duration::ZERO), async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn timeout_fires() {
        let err = with_timeout(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }
}
