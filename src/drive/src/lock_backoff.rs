use cloudstash_lib::{StashError, StashResult};
use std::time::{Duration, Instant};

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);
const DEADLINE: Duration = Duration::from_secs(120);

/// Bounded exponential backoff for the remote lock protocols. The overall
/// deadline keeps a lost lock file from stalling a client forever.
pub(crate) struct LockBackoff {
    started: Instant,
    delay: Duration,
}

impl LockBackoff {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            delay: INITIAL_DELAY,
        }
    }

    /// Sleeps for the current delay, doubling it for the next round.
    /// Fails once the deadline is exhausted.
    pub(crate) async fn wait(&mut self) -> StashResult<()> {
        if self.started.elapsed() >= DEADLINE {
            return Err(StashError::Io(
                "timed out waiting for the remote lock".to_string(),
            ));
        }
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        Ok(())
    }

    /// Randomized variant for providers whose lock protocol is
    /// check-then-create and benefits from desynchronized retries.
    pub(crate) async fn wait_jittered(&mut self) -> StashResult<()> {
        use rand::Rng;
        if self.started.elapsed() >= DEADLINE {
            return Err(StashError::Io(
                "timed out waiting for the remote lock".to_string(),
            ));
        }
        let jitter = rand::thread_rng().gen_range(0..=self.delay.as_millis() as u64);
        tokio::time::sleep(self.delay + Duration::from_millis(jitter)).await;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        Ok(())
    }
}
