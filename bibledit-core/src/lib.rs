pub mod endpoint;
pub mod external_url;
pub mod kernel;
pub mod paths;
pub mod readiness;
pub mod settings;
pub mod shell;
pub mod sync;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use kernel::Kernel;
pub use shell::{Shell, ShellEvent, ShellEventSender};
