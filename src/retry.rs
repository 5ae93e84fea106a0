//! Exponential backoff for retry loops.
//!
//! A [`BackoffHandler`] belongs to exactly one retry loop (for example one edge
//! connection slot). The delay for retry `n` is `base_delay * 2^n`, capped at
//! `max_delay`. Once `max_retries` is used up the handler either refuses to
//! back off, or with `retry_forever` keeps returning the last tier's delay.
//!
//! [`BackoffHandler::set_grace_period`] marks a point where the operation was
//! healthy. If the next failure comes after `grace_window` has elapsed from
//! that mark, the retry counter starts over from zero.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::constants::backoff::{BASE_DELAY, GRACE_WINDOW, MAX_DELAY};

/// Time source for [`BackoffHandler`], swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Completes once `delay` has elapsed.
    fn after(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(delay))
    }
}

pub struct BackoffHandler {
    /// Maximum number of retries. Zero disables backoff entirely.
    pub max_retries: u32,
    /// Keep retrying after `max_retries`, pinned at the last delay tier.
    pub retry_forever: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub grace_window: Duration,

    retries: u32,
    grace_mark: Option<Instant>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BackoffHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffHandler")
            .field("max_retries", &self.max_retries)
            .field("retry_forever", &self.retry_forever)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("retries", &self.retries)
            .finish()
    }
}

impl BackoffHandler {
    pub fn new(max_retries: u32, retry_forever: bool) -> Self {
        Self {
            max_retries,
            retry_forever,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            grace_window: GRACE_WINDOW,
            retries: 0,
            grace_mark: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Waits out the next backoff delay.
    ///
    /// Returns `false` without waiting when no retry is left, and `false` when
    /// `cancel` fires during the wait. A cancelled wait still consumes its retry.
    pub async fn backoff(&mut self, cancel: &CancellationToken) -> bool {
        if self.grace_expired() {
            self.retries = 0;
            self.grace_mark = None;
        }

        let Some(delay) = self.delay_for(self.retries) else {
            return false;
        };
        if self.retries < self.max_retries {
            self.retries += 1;
        }

        let timer = self.clock.after(delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = timer => true,
        }
    }

    /// The delay the next [`backoff`](Self::backoff) call would wait, without
    /// consuming a retry.
    pub fn get_max_backoff_duration(&self, cancel: &CancellationToken) -> Option<Duration> {
        if cancel.is_cancelled() {
            return None;
        }
        let retries = if self.grace_expired() { 0 } else { self.retries };
        self.delay_for(retries)
    }

    /// Marks the operation as settled at the current time.
    pub fn set_grace_period(&mut self) {
        self.grace_mark = Some(self.clock.now());
    }

    fn grace_expired(&self) -> bool {
        self.grace_mark.is_some_and(|mark| {
            self.clock.now().saturating_duration_since(mark) > self.grace_window
        })
    }

    fn delay_for(&self, retries: u32) -> Option<Duration> {
        if self.max_retries == 0 {
            return None;
        }
        let tier = if retries >= self.max_retries {
            if !self.retry_forever {
                return None;
            }
            self.max_retries - 1
        } else {
            retries
        };
        let factor = 1u32.checked_shl(tier).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
