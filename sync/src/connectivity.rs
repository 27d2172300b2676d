//! Whether a sync is worth attempting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the device currently believes it has a network.
///
/// Checked before every sync; it must answer immediately.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity set by the platform layer. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct ConnectivityFlag(Arc<AtomicBool>);

impl ConnectivityFlag {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn set_online(&self, online: bool) {
        let was = self.0.swap(online, Ordering::Relaxed);
        if was != online {
            tracing::debug!(online, "Connectivity changed");
        }
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = ConnectivityFlag::new(false);
        let platform = flag.clone();
        assert!(!flag.is_online());
        platform.set_online(true);
        assert!(flag.is_online());
    }
}
