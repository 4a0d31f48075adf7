//! Readiness, retry and restart policies.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::GatewayError;

/// Outcome of one readiness probe.
#[derive(Debug)]
pub enum Probe<T> {
    /// Ready, with whatever the probe produced.
    Ready(T),
    /// Not yet; try again after the interval.
    NotReady,
    /// Stop polling with this error.
    Abort(GatewayError),
}

/// Bounded fixed-interval retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts.
    pub interval: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Runs `probe` until it reports ready, aborts, or the attempt budget is
    /// spent. Returns the probe's value and the attempt it succeeded on.
    ///
    /// # Errors
    ///
    /// Returns the probe's abort error, or [`GatewayError::StartupTimeout`]
    /// once `max_attempts` probes were not ready.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> Result<(T, u32), GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Probe<T>>,
    {
        for attempt in 1..=self.max_attempts {
            match probe(attempt).await {
                Probe::Ready(value) => return Ok((value, attempt)),
                Probe::Abort(error) => return Err(error),
                Probe::NotReady => {
                    tracing::trace!(attempt, max = self.max_attempts, "not ready yet");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }
        Err(GatewayError::StartupTimeout {
            attempts: self.max_attempts,
        })
    }
}

/// How a freshly spawned process is judged ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// The process wrote a valid connection file.
    ConnectionFile,
    /// The process is still alive after a fixed grace period.
    Grace(Duration),
    /// An HTTP GET on the URL answers with a success status.
    Http(String),
    /// A TCP connection to `host:port` succeeds.
    Tcp(String),
}

impl ReadinessPolicy {
    /// Returns `true` if readiness is probed on an HTTP or TCP endpoint.
    #[must_use]
    pub const fn has_endpoint(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Tcp(_))
    }
}

impl FromStr for ReadinessPolicy {
    type Err = GatewayError;

    /// Parses `connection_file`, `grace:<ms>`, `http(s)://…` or
    /// `tcp://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "connection_file" {
            return Ok(Self::ConnectionFile);
        }
        if let Some(ms) = s.strip_prefix("grace:") {
            let ms = ms.parse::<u64>().map_err(|_| {
                GatewayError::InvalidRequest(format!("invalid grace period: {ms}"))
            })?;
            return Ok(Self::Grace(Duration::from_millis(ms)));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Http(s.to_string()));
        }
        if let Some(addr) = s.strip_prefix("tcp://")
            && !addr.is_empty()
        {
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(GatewayError::InvalidRequest(format!(
            "unknown readiness policy: {s}"
        )))
    }
}

/// Crash-loop bounds for automatic restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// A process that dies younger than this counts as a crash-loop strike.
    pub min_uptime: Duration,
    /// A failure sooner than this after the previous restart counts as a
    /// strike. A strike waits out whatever is left of this interval before
    /// restarting.
    pub min_restart_interval: Duration,
    /// Consecutive strikes that end automatic restarts.
    pub max_strikes: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_secs(1),
            min_restart_interval: Duration::from_secs(1),
            max_strikes: 2,
        }
    }
}

/// Verdict of [`RestartTracker::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart now.
    Restart,
    /// Restart after sleeping for the given duration.
    RestartAfter(Duration),
    /// Crash loop; stop restarting.
    GiveUp,
}

/// Restart bookkeeping for one supervised process across its restarts.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: u32,
    strikes: u32,
    last_restart_at: Option<Instant>,
}

impl RestartTracker {
    /// Creates a tracker with no history.
    #[must_use]
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: 0,
            strikes: 0,
            last_restart_at: None,
        }
    }

    /// Decides what to do about a process started at `started_at` that
    /// failed at `now`.
    ///
    /// A failure violating either bound is a strike; `max_strikes` strikes in
    /// a row give up. A failure within both bounds clears the strikes. The
    /// restart after a strike is delayed until `min_restart_interval` has
    /// passed since the previous restart, or since the start if there was
    /// none.
    pub fn on_failure(&mut self, started_at: Instant, now: Instant) -> RestartDecision {
        let uptime = now.saturating_duration_since(started_at);
        let since_restart = self
            .last_restart_at
            .map(|at| now.saturating_duration_since(at));
        let too_young = uptime < self.policy.min_uptime;
        let too_soon = since_restart.is_some_and(|d| d < self.policy.min_restart_interval);

        if !too_young && !too_soon {
            self.strikes = 0;
            return RestartDecision::Restart;
        }
        self.strikes += 1;
        tracing::warn!(
            strikes = self.strikes,
            uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            "kernel crash loop suspected"
        );
        if self.strikes >= self.policy.max_strikes {
            RestartDecision::GiveUp
        } else {
            let elapsed = since_restart.unwrap_or(uptime);
            let remaining = self.policy.min_restart_interval.saturating_sub(elapsed);
            RestartDecision::RestartAfter(remaining)
        }
    }

    /// Records a restart performed at `at`.
    pub fn record_restart(&mut self, at: Instant) {
        self.restarts += 1;
        self.last_restart_at = Some(at);
    }

    /// Restarts performed so far.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}
