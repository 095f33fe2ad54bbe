//! Periodic maintenance for one node.
//!
//! A single scheduler ticks at a fixed period and keeps one counter per
//! sweep, so each sweep runs at its own cadence:
//!
//! - **contacts**: strip devices whose connection died, evict contacts that
//!   have had no device for longer than the idle threshold
//! - **groups**: flush pending group active times to cache and store
//! - **appendices**: evict cached appendices nobody touched lately
//!
//! Ticks run to completion one after another; a slow sweep delays the next
//! tick instead of overlapping it.

use crate::config::ReaperConfig;
use crate::core::now_ms;
use crate::presence::PresenceDirectory;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one tick did. `None` means the sweep was not due.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Contacts evicted and devices stripped.
    pub contacts: Option<(usize, usize)>,
    /// Groups whose active time was written.
    pub groups: Option<usize>,
    /// Appendices evicted.
    pub appendices: Option<usize>,
}

/// Drives the maintenance sweeps of a [`PresenceDirectory`].
pub struct Reaper {
    directory: PresenceDirectory,
    config: ReaperConfig,
    contact_ticks: u32,
    group_ticks: u32,
    appendix_ticks: u32,
}

impl Reaper {
    /// Creates a reaper using the directory's reaper config.
    pub fn new(directory: PresenceDirectory) -> Self {
        let config = directory.config().reaper.clone();
        Self {
            directory,
            config,
            contact_ticks: 0,
            group_ticks: 0,
            appendix_ticks: 0,
        }
    }

    /// Runs one tick as of `now`.
    pub async fn tick_at(&mut self, now: u64) -> TickReport {
        let mut report = TickReport::default();

        if due(&mut self.contact_ticks, self.config.contact_every) {
            let swept = self.directory.sweep_contacts(now).await;
            report.contacts = Some((swept.evicted.len(), swept.stripped.len()));
        }
        if due(&mut self.group_ticks, self.config.group_every) {
            report.groups = Some(self.directory.flush_group_activity().await);
        }
        if due(&mut self.appendix_ticks, self.config.appendix_every) {
            report.appendices = Some(self.directory.sweep_appendices(now));
        }
        report
    }

    /// Runs one tick now.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(now_ms()).await
    }

    /// Ticks forever on the configured period.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = self.tick().await;
                tracing::trace!(?report, "Reaper tick");
            }
        })
    }
}

fn due(counter: &mut u32, every: u32) -> bool {
    *counter += 1;
    if *counter >= every.max(1) {
        *counter = 0;
        true
    } else {
        false
    }
}
