//! Bounded retry of vendor calls and polling for an expected state.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Upper bound for one retried call or one wait.
    #[serde(default = "defaults::timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "defaults::initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Added to the backoff after every transient failure.
    #[serde(default = "defaults::backoff_step", with = "humantime_serde")]
    pub backoff_step: Duration,
    #[serde(default = "defaults::max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default = "defaults::poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

mod defaults {
    use std::time::Duration;

    pub const fn timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }
    pub const fn initial_backoff() -> Duration {
        Duration::from_secs(1)
    }
    pub const fn backoff_step() -> Duration {
        Duration::from_secs(1)
    }
    pub const fn max_backoff() -> Duration {
        Duration::from_secs(10)
    }
    pub const fn poll_interval() -> Duration {
        Duration::from_secs(3)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: defaults::timeout(),
            initial_backoff: defaults::initial_backoff(),
            backoff_step: defaults::backoff_step(),
            max_backoff: defaults::max_backoff(),
            poll_interval: defaults::poll_interval(),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.backoff_step, self.max_backoff)
    }
}

/// Point in time after which no further attempt is started.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Linearly growing, capped backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    current: Duration,
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            step,
            max,
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = (self.current + self.step).min(self.max);
        result
    }
}

/// Why a retried call or a wait gave up.
#[derive(Debug)]
pub enum Failure<E> {
    /// A non-transient error, returned on first sight.
    Permanent(E),
    /// The deadline passed. Carries the last transient error, if any.
    Timeout {
        elapsed: Duration,
        last: Option<E>,
    },
}

/// Run `call` until it succeeds, fails permanently or the deadline passes.
pub async fn execute_with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_transient: P,
    mut call: F,
) -> Result<T, Failure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let deadline = policy.deadline();
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match call().await {
            Ok(result) => return Ok(result),
            Err(err) if !is_transient(&err) => return Err(Failure::Permanent(err)),
            Err(err) => {
                if deadline.is_expired() {
                    return Err(Failure::Timeout {
                        elapsed: deadline.elapsed(),
                        last: Some(err),
                    });
                }
                let delay = backoff.next_backoff().min(deadline.remaining());
                log::debug!("Attempt {attempt} failed transiently ({err}), retrying in {delay:?}");
                sleep(delay).await;
            }
        }
    }
}

/// Poll `read` until `predicate` accepts the observation (`None` meaning
/// absent). Transient read errors count as "not yet".
pub async fn wait_for_state<T, E, F, Fut, P, Q>(
    policy: &RetryPolicy,
    is_transient: Q,
    mut read: F,
    predicate: P,
) -> Result<Option<T>, Failure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    P: Fn(Option<&T>) -> bool,
    Q: Fn(&E) -> bool,
    E: Display,
{
    let deadline = policy.deadline();
    let mut last = None;

    loop {
        match read().await {
            Ok(observed) if predicate(observed.as_ref()) => return Ok(observed),
            Ok(_) => {}
            Err(err) if is_transient(&err) => {
                log::debug!("Transient error while waiting: {err}");
                last = Some(err);
            }
            Err(err) => return Err(Failure::Permanent(err)),
        }

        if deadline.is_expired() {
            return Err(Failure::Timeout {
                elapsed: deadline.elapsed(),
                last,
            });
        }
        sleep(policy.poll_interval.min(deadline.remaining())).await;
    }
}
