use std::fmt;

/// A navigation position shared with a companion Bible-study application.
///
/// The content is opaque to the shell; only equality matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VerseReference(String);

impl VerseReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VerseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VerseReference {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VerseReference {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ticks elapsed since the last transfer in the opposite direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceCounters {
    pub send: u32,
    pub receive: u32,
}

/// Transfers decided by one sync tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Publish this reference to the companion app.
    pub publish: Option<VerseReference>,
    /// Navigate the local document to this reference.
    pub apply: Option<VerseReference>,
}

impl SyncOutcome {
    pub fn is_idle(&self) -> bool {
        self.publish.is_none() && self.apply.is_none()
    }
}

/// Two-way reference exchange with hysteresis.
///
/// A transfer in one direction resets the other direction's counter, so a
/// reference bounced straight back by the companion cannot be re-sent on the
/// next tick.
#[derive(Debug, Default)]
pub struct ReferenceSync {
    counters: DebounceCounters,
    last_published: VerseReference,
    last_consumed: VerseReference,
    incoming: VerseReference,
}

impl ReferenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reference received from the companion app. Acted on at the
    /// next tick, never synchronously.
    pub fn deliver_incoming(&mut self, reference: VerseReference) {
        log::debug!("Companion reference received: {}", reference);
        self.incoming = reference;
    }

    pub fn counters(&self) -> DebounceCounters {
        self.counters
    }

    pub fn last_published(&self) -> &VerseReference {
        &self.last_published
    }

    pub fn last_consumed(&self) -> &VerseReference {
        &self.last_consumed
    }

    /// Run one sync step against the reference currently shown locally.
    ///
    /// Both counters are bumped first and both directions are judged on
    /// those values; the outbound transfer is then made before the inbound
    /// one. When both are due in the same tick both fire.
    ///
    /// Keep this order. Judging the inbound side after the outbound reset of
    /// the receive counter would mean both directions can never fire in one
    /// tick.
    pub fn tick(&mut self, local: &VerseReference) -> SyncOutcome {
        self.counters.send = self.counters.send.saturating_add(1);
        self.counters.receive = self.counters.receive.saturating_add(1);

        let send_due =
            !local.is_empty() && *local != self.last_published && self.counters.send > 1;
        let receive_due = !self.incoming.is_empty()
            && self.incoming != self.last_consumed
            && self.counters.receive > 1;

        let mut outcome = SyncOutcome::default();

        if send_due {
            log::debug!("Publishing reference {} to companion", local);
            self.last_published = local.clone();
            self.counters.receive = 0;
            outcome.publish = Some(local.clone());
        }

        if receive_due {
            log::debug!("Applying companion reference {}", self.incoming);
            self.last_consumed = self.incoming.clone();
            self.counters.send = 0;
            outcome.apply = Some(self.incoming.clone());
        }

        outcome
    }
}
