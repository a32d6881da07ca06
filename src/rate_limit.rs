//! Per-user admission control.
//!
//! Two independent limits per user: a sliding window of accepted submissions
//! (10 per hour by default) and a cap on submissions still being processed
//! (2 by default). The limiter only answers and records; the submission
//! pipeline decides when to call each hook.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: usize,
    pub window: Duration,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitRejection {
    #[error("request limit reached ({limit} per {window_secs}s), retry in {retry_after_secs}s")]
    TooManyRequests {
        limit: usize,
        window_secs: u64,
        retry_after_secs: u64,
    },

    #[error("too many files processing ({active} of {limit}), wait for one to finish")]
    TooManyConcurrent { active: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UserUsage {
    pub requests_in_window: usize,
    pub processing: usize,
}

#[derive(Debug, Default)]
struct UserWindow {
    requests: VecDeque<Instant>,
    processing: usize,
}

impl UserWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct UserRateLimiter {
    settings: RateLimitSettings,
    users: Mutex<HashMap<String, UserWindow>>,
}

impl UserRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Check both limits without recording anything.
    pub async fn may_submit(&self, user_id: &str) -> Result<(), RateLimitRejection> {
        if !self.settings.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut users = self.users.lock().await;
        let Some(window) = users.get_mut(user_id) else {
            return Ok(());
        };
        window.prune(now, self.settings.window);

        if window.processing >= self.settings.max_concurrent {
            return Err(RateLimitRejection::TooManyConcurrent {
                active: window.processing,
                limit: self.settings.max_concurrent,
            });
        }

        if window.requests.len() >= self.settings.max_requests {
            let retry_after = window
                .requests
                .front()
                .map(|oldest| self.settings.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or_default();
            return Err(RateLimitRejection::TooManyRequests {
                limit: self.settings.max_requests,
                window_secs: self.settings.window.as_secs(),
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        Ok(())
    }

    /// Record an accepted submission.
    pub async fn on_submit(&self, user_id: &str) {
        if !self.settings.enabled {
            return;
        }
        let mut users = self.users.lock().await;
        let window = users.entry(user_id.to_string()).or_default();
        window.requests.push_back(Instant::now());
        window.processing += 1;
        debug!(user_id = %user_id, processing = window.processing, "Submission recorded");
    }

    /// Record that a submission finished (successfully or not).
    pub async fn on_complete(&self, user_id: &str) {
        if !self.settings.enabled {
            return;
        }
        let mut users = self.users.lock().await;
        if let Some(window) = users.get_mut(user_id) {
            window.processing = window.processing.saturating_sub(1);
        }
    }

    pub async fn usage(&self, user_id: &str) -> UserUsage {
        let now = Instant::now();
        let mut users = self.users.lock().await;
        match users.get_mut(user_id) {
            Some(window) => {
                window.prune(now, self.settings.window);
                UserUsage {
                    requests_in_window: window.requests.len(),
                    processing: window.processing,
                }
            }
            None => UserUsage::default(),
        }
    }
}
