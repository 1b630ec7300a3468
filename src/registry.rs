use std::sync::{Arc, RwLock};

use crate::{Result, Statsig, StatsigError, StatsigOptions};

/// Holds at most one shared [`Statsig`] instance.
///
/// Create a registry in the application's composition root and hand it to the components that
/// need the shared instance.
///
/// ```
/// # use statsig_core::{InstanceRegistry, StatsigOptions};
/// let registry = InstanceRegistry::new();
/// let statsig = registry.new_shared("secret-key", StatsigOptions::new()).unwrap();
///
/// assert!(registry.new_shared("secret-key", StatsigOptions::new()).is_err());
/// assert!(std::sync::Arc::ptr_eq(&statsig, &registry.shared().unwrap()));
/// ```
#[derive(Default)]
pub struct InstanceRegistry {
    instance: RwLock<Option<Arc<Statsig>>>,
}

impl InstanceRegistry {
    pub fn new() -> InstanceRegistry {
        InstanceRegistry::default()
    }

    /// Create the shared instance. Fails with [`StatsigError::SharedInstanceExists`] if one is
    /// already registered; the existing instance is left untouched.
    pub fn new_shared(&self, sdk_key: &str, options: StatsigOptions) -> Result<Arc<Statsig>> {
        let mut instance = self
            .instance
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if instance.is_some() {
            log::warn!(
                target: "statsig",
                "shared instance already exists, call remove_shared() first"
            );
            return Err(StatsigError::SharedInstanceExists);
        }

        let statsig = Arc::new(Statsig::new(sdk_key, options));
        *instance = Some(Arc::clone(&statsig));
        Ok(statsig)
    }

    /// The shared instance, or [`StatsigError::NoSharedInstance`].
    pub fn shared(&self) -> Result<Arc<Statsig>> {
        self.instance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(StatsigError::NoSharedInstance)
    }

    pub fn has_shared(&self) -> bool {
        self.instance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Unregister the shared instance and return it. The caller decides whether to shut it down.
    pub fn remove_shared(&self) -> Option<Arc<Statsig>> {
        self.instance
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StatsigOptions {
        let mut options = StatsigOptions::new();
        options.disable_network(true);
        options
    }

    #[test]
    fn shared_lifecycle() {
        let registry = InstanceRegistry::new();
        assert!(!registry.has_shared());
        assert!(matches!(
            registry.shared(),
            Err(StatsigError::NoSharedInstance)
        ));

        let statsig = registry.new_shared("secret-key", options()).unwrap();
        assert!(registry.has_shared());
        assert!(Arc::ptr_eq(&statsig, &registry.shared().unwrap()));

        assert!(matches!(
            registry.new_shared("other-key", options()),
            Err(StatsigError::SharedInstanceExists)
        ));
        assert!(Arc::ptr_eq(&statsig, &registry.shared().unwrap()));

        let removed = registry.remove_shared().unwrap();
        assert!(Arc::ptr_eq(&statsig, &removed));
        assert!(!registry.has_shared());
        assert!(registry.remove_shared().is_none());

        registry.new_shared("secret-key", options()).unwrap();
        assert!(registry.has_shared());
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let first = InstanceRegistry::new();
        let second = InstanceRegistry::new();

        first.new_shared("secret-key", options()).unwrap();

        assert!(first.has_shared());
        assert!(!second.has_shared());
    }
}
