//! Per-isolate startup configuration.

/// Configuration applied when an isolate is created.
///
/// ```
/// use jsbox::IsolateStartupParameters;
///
/// let params = IsolateStartupParameters::new().with_max_heap_bytes(64 * 1024 * 1024);
/// assert_eq!(params.max_heap_bytes(), 64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolateStartupParameters {
    max_heap_bytes: u64,
}

impl IsolateStartupParameters {
    /// Parameters with every option at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the soft heap ceiling in bytes. Zero selects the helper default.
    ///
    /// The value is passed to the helper verbatim; the helper rounds it to
    /// its own allocation granularity.
    pub fn with_max_heap_bytes(mut self, bytes: u64) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// The configured heap ceiling in bytes (0 = helper default).
    pub fn max_heap_bytes(&self) -> u64 {
        self.max_heap_bytes
    }

    /// Whether a heap cap other than the default was requested.
    pub fn has_heap_cap(&self) -> bool {
        self.max_heap_bytes != 0
    }
}
