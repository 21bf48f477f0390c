use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::endpoint::ServerEndpoint;
use crate::external_url::ExternalUrlWatcher;
use crate::kernel::Kernel;
use crate::paths::LaunchPaths;
use crate::readiness::{ProbeOutcome, ReadinessProbe, ReadinessProber, ReadinessState};
use crate::settings::ShellSettings;
use crate::sync::{ReferenceSync, SyncOutcome, VerseReference};
use crate::teardown::{self, ShutdownOutcome};

/// Requests from the shell to the native host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ShellEvent {
    /// Replace the loading view with the live application at `url`.
    LoadUrl { url: String },
    /// Post `reference` on the companion notification topic.
    PublishReference { reference: String },
    /// Open `url` in the default browser.
    OpenExternalUrl { url: String },
    /// Something the user may need to know about, e.g. a server that never came up.
    Diagnostic { message: String },
}

/// Trait for delivering shell events to the host.
/// Implement this for your UI framework's event channel.
pub trait ShellEventSender: Send + Sync + 'static {
    fn send(&self, event: ShellEvent);
}

impl ShellEventSender for mpsc::UnboundedSender<ShellEvent> {
    fn send(&self, event: ShellEvent) {
        if mpsc::UnboundedSender::send(self, event).is_err() {
            log::debug!("Shell event receiver dropped");
        }
    }
}

/// Everything the periodic tasks mutate, kept under one lock so a tick sees
/// and updates it atomically.
#[derive(Debug)]
struct ShellState {
    prober: ReadinessProber,
    sync: ReferenceSync,
    external: ExternalUrlWatcher,
}

/// The application controller: owns the kernel handle and all process-wide
/// shell state. Built once at launch.
pub struct Shell<K: Kernel> {
    kernel: Arc<K>,
    settings: ShellSettings,
    endpoint: ServerEndpoint,
    state: Mutex<ShellState>,
    ready: Notify,
    tasks: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
}

impl<K: Kernel> Shell<K> {
    /// Initialize the kernel and negotiate the server endpoint.
    pub fn launch(
        kernel: Arc<K>,
        settings: ShellSettings,
        paths: &LaunchPaths,
    ) -> Result<Arc<Self>, String> {
        log::info!(
            "Initializing kernel (resources: {}, data: {})",
            paths.resources.display(),
            paths.writable_root.display()
        );
        kernel.initialize(&paths.resources, &paths.writable_root);

        let endpoint = ServerEndpoint::negotiate(kernel.as_ref(), &settings.default_port)?;
        let prober = ReadinessProber::new(endpoint.url().clone(), settings.probe_warn_after());

        Ok(Arc::new(Self {
            kernel,
            settings,
            endpoint,
            state: Mutex::new(ShellState {
                prober,
                sync: ReferenceSync::new(),
                external: ExternalUrlWatcher::new(),
            }),
            ready: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    pub fn readiness(&self) -> ReadinessState {
        self.state.lock().prober.state()
    }

    /// Start the readiness, companion-sync and external-URL tasks on the
    /// current tokio runtime. Only the first call has an effect.
    pub fn spawn<P: ReadinessProbe>(
        self: &Arc<Self>,
        probe: P,
        sender: Arc<dyn ShellEventSender>,
    ) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.shut_down.load(Ordering::SeqCst) {
            log::warn!("Shell tasks already started");
            return;
        }

        let readiness = tokio::spawn(Arc::clone(self).run_readiness(probe, Arc::clone(&sender)));
        tasks.push(readiness.abort_handle());

        if self.settings.companion_sync {
            let sync = tokio::spawn(Arc::clone(self).run_sync(Arc::clone(&sender)));
            tasks.push(sync.abort_handle());
        } else {
            log::info!("Companion reference sync disabled");
        }

        let external = tokio::spawn(Arc::clone(self).run_external_urls(sender));
        tasks.push(external.abort_handle());
    }

    /// Mailbox for references arriving from the companion app.
    pub fn receive_reference(&self, reference: &str) {
        self.state
            .lock()
            .sync
            .deliver_incoming(VerseReference::from(reference));
    }

    async fn run_readiness<P: ReadinessProbe>(
        self: Arc<Self>,
        probe: P,
        sender: Arc<dyn ShellEventSender>,
    ) {
        let probe = Arc::new(probe);
        let mut interval = tokio::time::interval(self.settings.probe_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.ready.notified() => break,
                _ = interval.tick() => {
                    if !self.state.lock().prober.wants_start() {
                        break;
                    }
                    // Starting may sit in native code for a while; the host
                    // thread needs the state lock meanwhile.
                    self.kernel.start();
                    if !self.state.lock().prober.mark_started(Instant::now()) {
                        break;
                    }
                    let shell = Arc::clone(&self);
                    let probe = Arc::clone(&probe);
                    let sender = Arc::clone(&sender);
                    in_flight.spawn(async move {
                        shell.probe_once(probe.as_ref(), sender.as_ref()).await;
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        in_flight.abort_all();
        log::debug!("Readiness prober stopped");
    }

    async fn probe_once<P: ReadinessProbe>(&self, probe: &P, sender: &dyn ShellEventSender) {
        // Give a server that is still binding a moment before knocking.
        tokio::time::sleep(self.settings.probe_grace()).await;

        let attempt = match self.state.lock().prober.begin_probe() {
            Some(attempt) => attempt,
            None => return,
        };
        let result = probe.probe(self.endpoint.url()).await;
        let outcome = self
            .state
            .lock()
            .prober
            .complete_probe(attempt, result, Instant::now());

        match outcome {
            ProbeOutcome::Ready(url) => {
                sender.send(ShellEvent::LoadUrl {
                    url: url.to_string(),
                });
                self.ready.notify_one();
            }
            ProbeOutcome::Unresponsive { failures, waited } => {
                sender.send(ShellEvent::Diagnostic {
                    message: format!(
                        "Bibledit has not started after {} seconds ({} attempts). Still trying.",
                        waited.as_secs(),
                        failures
                    ),
                });
            }
            ProbeOutcome::Retry | ProbeOutcome::Stale => {}
        }
    }

    async fn run_sync(self: Arc<Self>, sender: Arc<dyn ShellEventSender>) {
        let mut interval = tokio::time::interval(self.settings.sync_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sync_tick(sender.as_ref());
        }
    }

    /// One companion-sync step: publish the local reference and/or navigate
    /// to the received one.
    pub fn sync_tick(&self, sender: &dyn ShellEventSender) -> SyncOutcome {
        let local = VerseReference::from(self.kernel.reference_for_companion());
        let outcome = self.state.lock().sync.tick(&local);

        if let Some(reference) = &outcome.publish {
            sender.send(ShellEvent::PublishReference {
                reference: reference.to_string(),
            });
        }
        if let Some(reference) = &outcome.apply {
            self.kernel.put_reference_from_companion(reference.as_str());
        }
        outcome
    }

    async fn run_external_urls(self: Arc<Self>, sender: Arc<dyn ShellEventSender>) {
        let mut interval = tokio::time::interval(self.settings.external_url_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.external_url_tick(sender.as_ref());
        }
    }

    pub fn external_url_tick(&self, sender: &dyn ShellEventSender) {
        let value = self.kernel.external_url();
        let url = self.state.lock().external.observe(&value);
        if let Some(url) = url {
            log::info!("Kernel requested browser for {}", url);
            sender.send(ShellEvent::OpenExternalUrl { url });
        }
    }

    /// Cancel the periodic tasks and tear the kernel down. Returns `None` if
    /// the shell was already shut down.
    pub async fn shutdown(&self) -> Option<ShutdownOutcome> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            log::debug!("Shell already shut down");
            return None;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        Some(
            teardown::shutdown_kernel(
                self.kernel.as_ref(),
                self.settings.shutdown_poll(),
                self.settings.shutdown_timeout(),
            )
            .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeKernel, StartGate};
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use url::Url;

    /// Answers only once `ready_at` has passed, and only while not `broken`.
    struct ScriptedProbe {
        ready_at: Instant,
        calls: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
    }

    impl ReadinessProbe for ScriptedProbe {
        fn probe(&self, _url: &Url) -> impl Future<Output = Result<(), String>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if !self.broken.load(Ordering::SeqCst) && Instant::now() >= self.ready_at
            {
                Ok(())
            } else {
                Err("connection refused".to_string())
            };
            std::future::ready(result)
        }
    }

    fn paths() -> LaunchPaths {
        LaunchPaths {
            resources: PathBuf::from("/bundle/webroot"),
            writable_root: PathBuf::from("/data/bibledit"),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ShellEvent>) -> Vec<ShellEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn launch(
        kernel: FakeKernel,
        settings: ShellSettings,
    ) -> (Arc<FakeKernel>, Arc<Shell<FakeKernel>>) {
        let kernel = Arc::new(kernel);
        let shell = Shell::launch(Arc::clone(&kernel), settings, &paths()).unwrap();
        (kernel, shell)
    }

    #[test]
    fn launch_initializes_kernel_once() {
        let (kernel, shell) = launch(FakeKernel::with_port("8181"), ShellSettings::default());
        let initialized = kernel.initialized_with.lock().clone();
        assert_eq!(
            initialized,
            vec![(PathBuf::from("/bundle/webroot"), PathBuf::from("/data/bibledit"))]
        );
        assert_eq!(shell.endpoint().url().as_str(), "http://127.0.0.1:8181/");
        assert_eq!(shell.readiness(), ReadinessState::NotStarted);
    }

    #[test]
    fn launch_rejects_unusable_default_port() {
        let kernel = Arc::new(FakeKernel::default());
        let settings = ShellSettings {
            default_port: "not a port".into(),
            ..ShellSettings::default()
        };
        assert!(Shell::launch(kernel, settings, &paths()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_port_server_ready_after_delay() {
        let (kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = ScriptedProbe {
            ready_at: Instant::now() + Duration::from_secs(3),
            calls: Arc::clone(&calls),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        shell.spawn(probe, Arc::new(tx));

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_ne!(shell.readiness(), ReadinessState::Ready);
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(shell.readiness(), ReadinessState::Ready);
        assert_eq!(
            drain(&mut rx),
            vec![ShellEvent::LoadUrl {
                url: "http://127.0.0.1:9876/".to_string()
            }]
        );

        // Timer stopped: no more starts, probes or loads.
        let starts = kernel.starts();
        let probes = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(kernel.starts(), starts);
        assert_eq!(calls.load(Ordering::SeqCst), probes);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_kernel_start_leaves_state_unlocked() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let kernel = FakeKernel::default();
        *kernel.start_gate.lock() = Some(StartGate {
            entered: entered_tx,
            release: release_rx,
        });
        let (kernel, shell) = launch(kernel, ShellSettings::default());
        let probe = ScriptedProbe {
            ready_at: Instant::now(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        shell.spawn(probe, Arc::new(tx));

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The readiness task is inside kernel.start(); host calls must not wait on it.
        assert!(shell.state.try_lock().is_some());
        shell.receive_reference("GEN.1.1");
        assert_eq!(shell.readiness(), ReadinessState::NotStarted);

        release_tx.send(()).unwrap();
        assert_eq!(shell.shutdown().await, Some(ShutdownOutcome::Clean));
        assert_eq!(kernel.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_survives_later_probe_failures() {
        let (_kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let broken = Arc::new(AtomicBool::new(false));
        let probe = ScriptedProbe {
            ready_at: Instant::now(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::clone(&broken),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        shell.spawn(probe, Arc::new(tx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(shell.readiness(), ReadinessState::Ready);

        broken.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(shell.readiness(), ReadinessState::Ready);

        let loads = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ShellEvent::LoadUrl { .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_server_emits_one_diagnostic() {
        let settings = ShellSettings {
            probe_warn_after_secs: 5,
            ..ShellSettings::default()
        };
        let (kernel, shell) = launch(FakeKernel::default(), settings);
        let probe = ScriptedProbe {
            ready_at: Instant::now() + Duration::from_secs(3600),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        shell.spawn(probe, Arc::new(tx));

        tokio::time::sleep(Duration::from_secs(20)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ShellEvent::Diagnostic { .. }));
        assert_eq!(shell.readiness(), ReadinessState::Probing);
        // Still retrying on every tick.
        assert!(kernel.starts() >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn companion_references_flow_both_ways() {
        let (kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let probe = ScriptedProbe {
            ready_at: Instant::now(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        kernel.set_local_reference("GEN.1.1");
        shell.spawn(probe, Arc::new(tx));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let published: Vec<ShellEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ShellEvent::PublishReference { .. }))
            .collect();
        assert_eq!(
            published,
            vec![ShellEvent::PublishReference {
                reference: "GEN.1.1".to_string()
            }]
        );

        shell.receive_reference("PSA.23.1");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(kernel.applied(), vec!["PSA.23.1".to_string()]);

        // The unchanged local reference is never re-sent.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ShellEvent::PublishReference { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn companion_sync_can_be_disabled() {
        let settings = ShellSettings {
            companion_sync: false,
            ..ShellSettings::default()
        };
        let (kernel, shell) = launch(FakeKernel::default(), settings);
        let probe = ScriptedProbe {
            ready_at: Instant::now(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        kernel.set_local_reference("GEN.1.1");
        shell.spawn(probe, Arc::new(tx));
        shell.receive_reference("EXO.1.1");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ShellEvent::PublishReference { .. })));
        assert!(kernel.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn external_url_opens_once_per_value() {
        let (kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let probe = ScriptedProbe {
            ready_at: Instant::now(),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        kernel.set_external_url("https://bibledit.org/help");
        shell.spawn(probe, Arc::new(tx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let opened: Vec<ShellEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ShellEvent::OpenExternalUrl { .. }))
            .collect();
        assert_eq!(
            opened,
            vec![ShellEvent::OpenExternalUrl {
                url: "https://bibledit.org/help".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_runs_once_and_stops_ticking() {
        let (kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let probe = ScriptedProbe {
            ready_at: Instant::now() + Duration::from_secs(3600),
            calls: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        shell.spawn(probe, Arc::new(tx));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(shell.shutdown().await, Some(ShutdownOutcome::Clean));
        assert_eq!(shell.shutdown().await, None);
        assert_eq!(kernel.shutdown_calls.load(Ordering::SeqCst), 1);

        let starts = kernel.starts();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(kernel.starts(), starts);
    }

    #[test]
    fn sync_tick_publishes_and_applies() {
        let (kernel, shell) = launch(FakeKernel::default(), ShellSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        kernel.set_local_reference("GEN.1.1");
        shell.receive_reference("EXO.1.1");
        assert!(shell.sync_tick(&tx).is_idle());

        let outcome = shell.sync_tick(&tx);
        assert!(outcome.publish.is_some() && outcome.apply.is_some());
        assert_eq!(kernel.applied(), vec!["EXO.1.1".to_string()]);
        assert_eq!(
            drain(&mut rx),
            vec![ShellEvent::PublishReference {
                reference: "GEN.1.1".to_string()
            }]
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ShellEvent::LoadUrl {
            url: "http://127.0.0.1:9876/".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "loadUrl", "url": "http://127.0.0.1:9876/" })
        );

        let json = serde_json::to_value(ShellEvent::PublishReference {
            reference: "GEN.1.1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "publishReference");
    }
}
