//! Runtime options of a weekly sync, derived from [`Settings`].

use std::time::Duration;

use digest_core::Settings;

use crate::poller::PollConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub source_poll: PollConfig,
    pub text_poll: PollConfig,
    pub audio_poll: PollConfig,
    /// Batch and episode names are `"<name_prefix> dd/mm/YYYY"`.
    pub name_prefix: String,
    pub episode_profile: String,
    pub speaker_profile: String,
    pub retain_item_outcomes: bool,
    /// Fail abandoned `running` rows older than this before starting.
    pub stale_after: Option<Duration>,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let polling = &settings.polling;
        let max_interval = Duration::from_secs(polling.max_interval_secs);
        let generation = |timeout_secs: u64| PollConfig {
            interval: Duration::from_secs(polling.generation_interval_secs),
            max_interval,
            concurrency: 1,
            timeout: Duration::from_secs(timeout_secs),
            error_budget: polling.error_budget,
        };

        Self {
            source_poll: PollConfig {
                interval: Duration::from_secs(polling.source_interval_secs),
                max_interval,
                concurrency: polling.concurrency,
                timeout: Duration::from_secs(polling.source_timeout_secs),
                error_budget: polling.error_budget,
            },
            text_poll: generation(polling.text_timeout_secs),
            audio_poll: generation(polling.audio_timeout_secs),
            name_prefix: settings.notebook.name_prefix.clone(),
            episode_profile: settings.notebook.episode_profile.clone(),
            speaker_profile: settings.notebook.speaker_profile.clone(),
            retain_item_outcomes: settings.ledger.retain_item_outcomes,
            stale_after: Some(settings.stale_after()),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let options = SyncOptions::default();
        assert_eq!(options.source_poll.concurrency, 5);
        assert_eq!(options.source_poll.interval, Duration::from_secs(5));
        assert_eq!(options.source_poll.timeout, Duration::from_secs(300));
        assert_eq!(options.text_poll.concurrency, 1);
        assert_eq!(options.audio_poll.timeout, Duration::from_secs(600));
        assert_eq!(options.name_prefix, "Semaine du");
        assert_eq!(options.stale_after, Some(Duration::from_secs(1500 * 3)));
    }
}
