use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer. Worker loops use it to pause between iterations.
pub struct TokioSleeper(
    /// Divides every requested duration. Zero is treated as one.
    pub u32,
);

impl TokioSleeper {
    pub const fn default() -> Self {
        Self(1)
    }

    /// Sleeps `scale` times faster than asked. Useful to drive long intervals
    /// in tests.
    pub const fn accelerated(scale: u32) -> Self {
        Self(scale)
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration.checked_div(self.0).unwrap_or(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn accelerated_sleeper_divides_the_duration() {
        let start = Instant::now();
        TokioSleeper::accelerated(100)
            .sleep(Duration::from_secs(5))
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_scale_sleeps_the_full_duration() {
        let start = Instant::now();
        TokioSleeper::accelerated(0)
            .sleep(Duration::from_millis(30))
            .await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
