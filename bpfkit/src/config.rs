use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bpfkit/config.toml";

/// Tool settings. Layered as built-in defaults, then the config file, then
/// `BPFKIT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolConfig {
    /// Relative object paths on the command line resolve against this.
    pub bpffs_root: PathBuf,
    pub poll_timeout_ms: u64,
    pub channel_capacity: usize,
    pub flush_every: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            bpffs_root: PathBuf::from("/sys/fs/bpf"),
            poll_timeout_ms: 1000,
            channel_capacity: 1024,
            flush_every: 64,
        }
    }
}

impl ToolConfig {
    /// Load settings. An explicit `path` must exist; otherwise the default
    /// location is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let defaults = ToolConfig::default();
        let builder = Config::builder()
            .set_default("bpffs_root", defaults.bpffs_root.to_string_lossy().into_owned())?
            .set_default("poll_timeout_ms", defaults.poll_timeout_ms as i64)?
            .set_default("channel_capacity", defaults.channel_capacity as i64)?
            .set_default("flush_every", defaults.flush_every as i64)?;
        let builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::from(Path::new(DEFAULT_CONFIG_PATH)).required(false)),
        };
        let config = builder
            .add_source(Environment::with_prefix("BPFKIT").try_parsing(true))
            .build()?;
        let tool: ToolConfig = config.try_deserialize()?;
        if tool.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be at least 1");
        }
        Ok(tool)
    }

    /// `object` as given if absolute, else under `bpffs_root`.
    pub fn resolve(&self, object: &Path) -> PathBuf {
        if object.is_absolute() {
            object.to_path_buf()
        } else {
            self.bpffs_root.join(object)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "bpffs_root = \"/mnt/bpf\"\nflush_every = 8").unwrap();

        let config = ToolConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bpffs_root, PathBuf::from("/mnt/bpf"));
        assert_eq!(config.flush_every, 8);
        assert_eq!(config.poll_timeout_ms, 1000);
        assert_eq!(config.channel_capacity, 1024);
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ToolConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "channel_capacity = 0").unwrap();
        assert!(ToolConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn relative_objects_live_under_the_root() {
        let config = ToolConfig::default();
        assert_eq!(
            config.resolve(Path::new("tc/globals/events")),
            PathBuf::from("/sys/fs/bpf/tc/globals/events")
        );
        assert_eq!(config.resolve(Path::new("/tmp/pin")), PathBuf::from("/tmp/pin"));
    }
}
