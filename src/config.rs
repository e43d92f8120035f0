//! Runtime configuration
//!
//! Every filesystem location the library touches is collected here so
//! tests and unusual installations can redirect them. `Config::default()`
//! gives the usual system paths; `Config::from_env()` layers environment
//! overrides on top.

use std::env;
use std::path::PathBuf;

/// Where sysfs is mounted
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Kernel VGA arbiter device
pub const DEFAULT_VGAARB_PATH: &str = "/dev/vga_arbiter";

/// Physical memory device used by the raw port backend
pub const DEFAULT_DEV_MEM_PATH: &str = "/dev/mem";

/// pci.ids locations, most common first
///
/// Each entry is tried with a `.gz` suffix first when gzip support is built.
pub const DEFAULT_IDS_PATHS: &[&str] = &[
    "/usr/share/hwdata/pci.ids",
    "/usr/share/misc/pci.ids",
    "/usr/share/pci.ids",
    "/usr/local/share/pciids/pci.ids",
];

/// BSD ships the database under a different name
pub const BSD_IDS_FALLBACK: &str = "/usr/share/misc/pci_vendors";

const ENV_SYSFS_ROOT: &str = "PCIACCESS_SYSFS_ROOT";
const ENV_IDS: &str = "PCIACCESS_IDS";
const ENV_VGAARB: &str = "PCIACCESS_VGAARB";
const ENV_DEV_MEM: &str = "PCIACCESS_DEV_MEM";

/// Paths used by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub sysfs_root: PathBuf,
    /// Candidate pci.ids files, searched in order
    pub ids_paths: Vec<PathBuf>,
    pub vgaarb_path: PathBuf,
    pub dev_mem_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let mut ids_paths: Vec<PathBuf> = DEFAULT_IDS_PATHS.iter().map(PathBuf::from).collect();
        ids_paths.push(PathBuf::from(BSD_IDS_FALLBACK));

        Config {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            ids_paths,
            vgaarb_path: PathBuf::from(DEFAULT_VGAARB_PATH),
            dev_mem_path: PathBuf::from(DEFAULT_DEV_MEM_PATH),
        }
    }
}

impl Config {
    /// Defaults overridden by `PCIACCESS_*` environment variables
    ///
    /// `PCIACCESS_IDS` is a colon separated list and replaces the search
    /// path entirely.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(root) = env::var_os(ENV_SYSFS_ROOT) {
            config.sysfs_root = PathBuf::from(root);
        }
        if let Some(ids) = env::var_os(ENV_IDS) {
            config.ids_paths = env::split_paths(&ids).collect();
        }
        if let Some(path) = env::var_os(ENV_VGAARB) {
            config.vgaarb_path = PathBuf::from(path);
        }
        if let Some(path) = env::var_os(ENV_DEV_MEM) {
            config.dev_mem_path = PathBuf::from(path);
        }

        config
    }

    /// Same defaults with a single pci.ids file
    pub fn with_ids_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ids_paths = vec![path.into()];
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.vgaarb_path, PathBuf::from("/dev/vga_arbiter"));
        assert_eq!(config.ids_paths.first(), Some(&PathBuf::from("/usr/share/hwdata/pci.ids")));
        assert_eq!(config.ids_paths.last(), Some(&PathBuf::from(BSD_IDS_FALLBACK)));
    }

    #[test]
    fn test_with_ids_path() {
        let config = Config::default().with_ids_path("/tmp/pci.ids");
        assert_eq!(config.ids_paths, vec![PathBuf::from("/tmp/pci.ids")]);
    }
}
