//! Runtime configuration

use std::time::Duration;

use mantle_gc::GcConfig;

/// How native extension libraries are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NativeLockPolicy {
    /// No lock unless the library is listed as always locked
    #[default]
    Unlocked,
    /// One private lock per library
    PerLibrary,
    /// Every library shares one lock
    Global,
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Heap and collector settings
    pub gc: GcConfig,
    /// Native library locking (default: unlocked)
    pub native_lock_policy: NativeLockPolicy,
    /// Libraries that get a private lock even when unlocked
    pub always_locked_libraries: Vec<String>,
    /// Run policy-triggered cycles on a helper thread (default: false)
    pub background_collector: bool,
    /// Background collector poll interval (default: 10ms)
    pub background_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            native_lock_policy: NativeLockPolicy::default(),
            always_locked_libraries: Vec::new(),
            background_collector: false,
            background_poll: Duration::from_millis(10),
        }
    }
}
