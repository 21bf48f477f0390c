/// Turns the kernel's polled "open this in a browser" value into one-shot
/// requests: a URL fires once when it appears, not on every tick it stays.
#[derive(Debug, Default)]
pub struct ExternalUrlWatcher {
    last: String,
}

impl ExternalUrlWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest polled value; returns the URL to open, if any.
    pub fn observe(&mut self, value: &str) -> Option<String> {
        let value = value.trim();
        if value == self.last {
            return None;
        }
        self.last = value.to_string();
        if value.is_empty() {
            None
        } else {
            Some(self.last.clone())
        }
    }
}
