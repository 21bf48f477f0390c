use std::time::Duration;

use tokio::time::Instant;

use crate::kernel::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The kernel stopped before the deadline.
    Clean,
    /// The kernel was still running at the deadline and was shut down anyway.
    TimedOut,
}

/// Stop the kernel, wait for it to wind down, then release its resources.
///
/// `is_running` is polled on a timer rather than spun on, and the wait is
/// bounded by `timeout`.
pub async fn shutdown_kernel(
    kernel: &dyn Kernel,
    poll_interval: Duration,
    timeout: Duration,
) -> ShutdownOutcome {
    log::info!("Stopping embedded kernel");
    kernel.stop();

    let deadline = Instant::now() + timeout;
    let mut outcome = ShutdownOutcome::Clean;
    while kernel.is_running() {
        if Instant::now() >= deadline {
            log::error!(
                "Kernel still running {}ms after stop request, forcing shutdown",
                timeout.as_millis()
            );
            outcome = ShutdownOutcome::TimedOut;
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }

    kernel.shutdown();
    log::info!("Embedded kernel shut down");
    outcome
}
