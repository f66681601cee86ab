//! Version information for coglet.

/// Coglet version from Cargo.toml
pub const COGLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for the runtime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Coglet runtime version.
    pub coglet: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            coglet: COGLET_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_coglet_version() {
        let info = VersionInfo::new();
        assert_eq!(info.coglet, COGLET_VERSION);
    }

    #[test]
    fn version_info_serializes() {
        let json = serde_json::to_value(VersionInfo::new()).unwrap();
        assert!(json["coglet"].is_string());
    }
}
