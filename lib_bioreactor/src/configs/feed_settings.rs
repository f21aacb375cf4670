//! # Shared Feed Settings
//!
//! Process-wide, read-mostly holder for the current [`FeedSettings`]. The
//! handle is constructed explicitly and cloned into every consumer; readers get
//! a cheap `Arc` snapshot, writers swap the whole value after validating it.

use std::sync::{Arc, RwLock};

use crate::errors::ConfigError;
use crate::models::FeedSettings;

#[cfg(feature = "connections")]
use crate::connections::local_store::LocalStore;
#[cfg(feature = "connections")]
use crate::errors::PersistenceError;

#[derive(Debug, Clone)]
pub struct SharedFeedSettings {
    inner: Arc<RwLock<Arc<FeedSettings>>>,
}

impl SharedFeedSettings {
    pub fn new(initial: FeedSettings) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        })
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Arc<FeedSettings> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Validates `settings` and makes them current.
    pub fn replace(&self, settings: FeedSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(settings);
        Ok(())
    }

    /// Re-reads the settings from the local store. Keeps the current value
    /// when the store holds none.
    #[cfg(feature = "connections")]
    pub async fn reload(&self, store: &LocalStore) -> Result<Arc<FeedSettings>, PersistenceError> {
        match store.get_feed_settings().await {
            Some(settings) => {
                self.replace(settings)?;
                log::info!("Feed settings reloaded from local store");
            }
            None => log::warn!("No feed settings stored; keeping current values"),
        }
        Ok(self.get())
    }
}

impl Default for SharedFeedSettings {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(FeedSettings::default()))),
        }
    }
}
