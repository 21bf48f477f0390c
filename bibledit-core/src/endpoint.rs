use url::Url;

use crate::kernel::Kernel;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Port the kernel listens on when it has not reported one.
pub const DEFAULT_PORT: &str = "9876";

/// Where the embedded server listens. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    host: &'static str,
    port: String,
    url: Url,
}

impl ServerEndpoint {
    /// Ask the kernel for its port, falling back to `default_port` when the
    /// kernel has none yet or reports something that is not a port number.
    pub fn negotiate(kernel: &dyn Kernel, default_port: &str) -> Result<Self, String> {
        let port = match kernel.network_port() {
            Some(port) if is_valid_port(port.trim()) => port.trim().to_string(),
            Some(port) if !port.trim().is_empty() => {
                log::warn!(
                    "Kernel reported unusable port '{}', using {}",
                    port,
                    default_port
                );
                default_port.to_string()
            }
            _ => {
                log::info!("Kernel has no network port yet, using {}", default_port);
                default_port.to_string()
            }
        };
        let raw = format!("http://{}:{}/", LOOPBACK_HOST, port);
        let url = Url::parse(&raw).map_err(|e| format!("Invalid server URL {}: {}", raw, e))?;
        Ok(Self {
            host: LOOPBACK_HOST,
            port,
            url,
        })
    }

    pub fn host(&self) -> &str {
        self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Root URL of the embedded server, e.g. `http://127.0.0.1:9876/`.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn is_valid_port(port: &str) -> bool {
    matches!(port.parse::<u16>(), Ok(p) if p != 0)
}
