use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

/// Startup progress of the embedded server. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadinessState {
    NotStarted,
    Starting,
    Probing,
    Ready,
}

/// A single readiness check against the embedded server.
pub trait ReadinessProbe: Send + Sync + 'static {
    /// Resolve to `Ok` once the server answered. Connection failures are
    /// expected while the server is still binding and come back as `Err`.
    fn probe(&self, url: &Url) -> impl Future<Output = Result<(), String>> + Send;
}

/// Probes the server with a plain HTTP GET.
///
/// Any HTTP response counts, whatever the status: an answer means the kernel
/// is accepting connections. Proxy settings from the environment are ignored.
#[derive(Clone)]
pub struct HttpProbe {
    agent: ureq::Agent,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            // The server is always on loopback; never route it via HTTP_PROXY.
            .proxy(None)
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe(&self, url: &Url) -> impl Future<Output = Result<(), String>> + Send {
        let agent = self.agent.clone();
        let url = url.to_string();
        async move {
            tokio::task::spawn_blocking(move || {
                let mut response = agent
                    .get(url.as_str())
                    .call()
                    .map_err(|e| format!("GET {} failed: {}", url, e))?;
                response
                    .body_mut()
                    .read_to_string()
                    .map(|_| ())
                    .map_err(|e| format!("Failed to read response from {}: {}", url, e))
            })
            .await
            .map_err(|e| format!("Probe task failed: {}", e))?
        }
    }
}

/// What happened to a finished probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// First successful probe: load this URL in the web view.
    Ready(Url),
    /// The server did not answer yet; try again next tick.
    Retry,
    /// The server has not answered for longer than the warning threshold.
    /// Reported once; probing continues as for `Retry`.
    Unresponsive { failures: u64, waited: Duration },
    /// The result arrived after readiness was already reached.
    Stale,
}

/// Decides when to start the kernel, when to probe it and when the UI may
/// switch from the loading view to the live application.
#[derive(Debug)]
pub struct ReadinessProber {
    state: ReadinessState,
    url: Url,
    warn_after: Duration,
    started_at: Option<Instant>,
    attempts: u64,
    failures: u64,
    warned: bool,
}

impl ReadinessProber {
    pub fn new(url: Url, warn_after: Duration) -> Self {
        Self {
            state: ReadinessState::NotStarted,
            url,
            warn_after,
            started_at: None,
            attempts: 0,
            failures: 0,
            warned: false,
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Whether this tick should send the kernel a start request.
    ///
    /// The kernel ignores repeated start requests, so every tick before
    /// readiness sends one.
    pub fn wants_start(&self) -> bool {
        !self.is_ready()
    }

    /// Record a start request sent at `now`. Returns whether a probe should
    /// follow.
    pub fn mark_started(&mut self, now: Instant) -> bool {
        if self.is_ready() {
            return false;
        }
        if self.state == ReadinessState::NotStarted {
            log::info!("Starting embedded server, waiting for {}", self.url);
            self.state = ReadinessState::Starting;
            self.started_at = Some(now);
        }
        true
    }

    /// Register a probe about to be issued. `None` once ready.
    pub fn begin_probe(&mut self) -> Option<u64> {
        if self.is_ready() {
            return None;
        }
        if self.state < ReadinessState::Probing {
            self.state = ReadinessState::Probing;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub fn complete_probe(
        &mut self,
        attempt: u64,
        result: Result<(), String>,
        now: Instant,
    ) -> ProbeOutcome {
        if self.is_ready() {
            log::debug!("Ignoring result of probe #{} after readiness", attempt);
            return ProbeOutcome::Stale;
        }

        match result {
            Ok(()) => {
                self.state = ReadinessState::Ready;
                log::info!(
                    "Embedded server answered at {} after {} probe(s)",
                    self.url,
                    attempt
                );
                ProbeOutcome::Ready(self.url.clone())
            }
            Err(e) => {
                self.failures += 1;
                log::debug!("Probe #{} not answered yet: {}", attempt, e);

                let waited = self
                    .started_at
                    .map(|started| now.saturating_duration_since(started))
                    .unwrap_or_default();
                if !self.warned && waited >= self.warn_after {
                    self.warned = true;
                    log::warn!(
                        "Embedded server at {} still not answering after {}s ({} failed probes)",
                        self.url,
                        waited.as_secs(),
                        self.failures
                    );
                    return ProbeOutcome::Unresponsive {
                        failures: self.failures,
                        waited,
                    };
                }
                ProbeOutcome::Retry
            }
        }
    }
}
