//! In-memory kernel used by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::kernel::Kernel;

#[derive(Default)]
pub struct FakeKernel {
    pub port: Option<String>,
    pub initialized_with: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    pub running: AtomicBool,
    /// Number of `is_running` polls that still report true after `stop`.
    pub stop_delay_polls: AtomicUsize,
    pub external_url: Mutex<String>,
    pub local_reference: Mutex<String>,
    pub applied_references: Mutex<Vec<String>>,
    /// Makes the first `start` signal `entered` and block until `release`.
    pub start_gate: Mutex<Option<StartGate>>,
}

pub struct StartGate {
    pub entered: mpsc::Sender<()>,
    pub release: mpsc::Receiver<()>,
}

impl FakeKernel {
    pub fn with_port(port: &str) -> Self {
        Self {
            port: Some(port.to_string()),
            ..Self::default()
        }
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn set_local_reference(&self, reference: &str) {
        *self.local_reference.lock() = reference.to_string();
    }

    pub fn set_external_url(&self, url: &str) {
        *self.external_url.lock() = url.to_string();
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied_references.lock().clone()
    }
}

impl Kernel for FakeKernel {
    fn initialize(&self, resources: &Path, writable_root: &Path) {
        self.initialized_with
            .lock()
            .push((resources.to_path_buf(), writable_root.to_path_buf()));
    }

    fn start(&self) {
        let gate = self.start_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn network_port(&self) -> Option<String> {
        self.port.clone()
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        if self.stop_calls.load(Ordering::SeqCst) == 0 {
            return self.running.load(Ordering::SeqCst);
        }
        let remaining = self.stop_delay_polls.load(Ordering::SeqCst);
        if remaining == usize::MAX {
            return true;
        }
        if remaining > 0 {
            self.stop_delay_polls.store(remaining - 1, Ordering::SeqCst);
            return true;
        }
        self.running.store(false, Ordering::SeqCst);
        false
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn external_url(&self) -> String {
        self.external_url.lock().clone()
    }

    fn reference_for_companion(&self) -> String {
        self.local_reference.lock().clone()
    }

    fn put_reference_from_companion(&self, reference: &str) {
        self.applied_references.lock().push(reference.to_string());
    }
}
