//! Hot-reloadable settings.

use std::sync::Arc;

use tokio::sync::watch;

use super::settings::GovernorSettings;
use super::{ConfigResult, SettingsLoader, validator};

/// Shares the current settings and publishes validated replacements.
///
/// Subscribers see only settings that passed validation; a rejected update
/// leaves the current settings in place.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    sender: Arc<watch::Sender<Arc<GovernorSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: GovernorSettings) -> ConfigResult<Self> {
        validator::validate(&settings)?;
        let (sender, _) = watch::channel(Arc::new(settings));
        Ok(Self {
            sender: Arc::new(sender),
        })
    }

    pub fn current(&self) -> Arc<GovernorSettings> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GovernorSettings>> {
        self.sender.subscribe()
    }

    pub fn publish(&self, settings: GovernorSettings) -> ConfigResult<()> {
        if let Err(e) = validator::validate(&settings) {
            tracing::warn!(error = %e, "Rejected settings update");
            return Err(e);
        }
        self.sender.send_replace(Arc::new(settings));
        tracing::info!("Settings updated");
        Ok(())
    }

    /// Re-run `loader` and publish the result.
    pub fn reload(&self, loader: &SettingsLoader) -> ConfigResult<()> {
        self.publish(loader.load()?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let handle = SettingsHandle::new(GovernorSettings::default()).unwrap();
        let mut rx = handle.subscribe();

        let updated = GovernorSettings::default().with_batch(3, Duration::from_millis(50));
        handle.publish(updated).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().batch.max_size, 3);
        assert_eq!(handle.current().batch.max_size, 3);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let handle = SettingsHandle::new(GovernorSettings::default()).unwrap();
        let rx = handle.subscribe();

        let mut bad = GovernorSettings::default();
        bad.batch.max_size = 0;
        assert!(handle.publish(bad).is_err());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(handle.current().batch.max_size, 8);
    }
}
