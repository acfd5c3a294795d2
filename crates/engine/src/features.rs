//! Feature gate injected at construction
//!
//! Deployments switch optional capabilities off through a predicate instead
//! of global state. The default gate enables everything.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Write-through, write-behind and read-through
    BackingSource,
    WriteBehind,
    /// Death callbacks for disconnected clients
    ClientDeathNotification,
}

#[derive(Clone)]
pub struct FeatureGate(Arc<dyn Fn(Feature) -> bool + Send + Sync>);

impl FeatureGate {
    pub fn new(predicate: impl Fn(Feature) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn all_enabled() -> Self {
        Self::new(|_| true)
    }

    /// Everything except `disabled`
    pub fn without(disabled: &[Feature]) -> Self {
        let disabled = disabled.to_vec();
        Self::new(move |f| !disabled.contains(&f))
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        (self.0)(feature)
    }
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self::all_enabled()
    }
}

impl std::fmt::Debug for FeatureGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FeatureGate").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enables_everything() {
        let gate = FeatureGate::default();
        assert!(gate.is_enabled(Feature::BackingSource));
        assert!(gate.is_enabled(Feature::WriteBehind));
        assert!(gate.is_enabled(Feature::ClientDeathNotification));
    }

    #[test]
    fn test_without() {
        let gate = FeatureGate::without(&[Feature::WriteBehind]);
        assert!(gate.is_enabled(Feature::BackingSource));
        assert!(!gate.is_enabled(Feature::WriteBehind));
    }
}
