use std::path::PathBuf;

/// Root directory for caches, the daemon socket and its lock files.
/// `$XDG_CACHE_HOME/coffre`, falling back to `~/.cache/coffre`.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("coffre");
        }
    }
    home_dir().join(".cache").join("coffre")
}

/// Default configuration file path:
/// `$XDG_CONFIG_HOME/coffre/config.yaml`, falling back to
/// `~/.config/coffre/config.yaml`.
pub fn config_file() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("coffre").join("config.yaml");
        }
    }
    home_dir().join(".config").join("coffre").join("config.yaml")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}
