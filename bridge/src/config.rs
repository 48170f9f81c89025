//! Bridge configuration.

use tether_hostapi::handles::DEFAULT_MAX_HANDLES;

/// Configuration for loading and running a guest.
///
/// Controls memory sizing, the handle table bound, and the names the guest
/// ABI uses for its imports and exports.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Initial linear memory pages for a memory the bridge creates.
    /// Default: 38 pages (~2.4 MiB).
    pub initial_pages: u32,

    /// Upper bound on linear memory pages (1 page = 64 KiB).
    /// Default: 16384 pages = 1 GiB.
    pub max_pages: u32,

    /// Total handle table slots, reserved prefix included.
    pub max_handles: usize,

    /// Import module the boundary-call adapters are registered under.
    pub import_module: String,

    /// Optional guest entry point run once by `start`.
    pub start_export: String,

    /// Name of the guest's exported memory, if it exports one.
    pub memory_export: String,

    /// Name of the guest's exported function table.
    pub table_export: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_pages: 38,
            max_pages: 16384,
            max_handles: DEFAULT_MAX_HANDLES,
            import_module: "tether".into(),
            start_export: "tether_start".into(),
            memory_export: "memory".into(),
            table_export: "__indirect_function_table".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.initial_pages, 38);
        assert_eq!(config.max_pages, 16384);
        assert_eq!(config.import_module, "tether");
        assert_eq!(config.table_export, "__indirect_function_table");
    }
}
