// ABOUTME: XDG Base Directory paths for cross-platform config and persisted state
// ABOUTME: Provides standardized paths for logs, store files, and configuration

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "crosswire";
const APPLICATION: &str = "crosswire";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Get the data directory path (e.g., ~/.local/share/crosswire/)
/// Falls back to ./data if XDG directories unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get the log directory path (inside data dir)
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Persisted request registry document
pub fn requests_file() -> PathBuf {
    data_dir().join("requests.json")
}

/// Persisted cron job document
pub fn jobs_file() -> PathBuf {
    data_dir().join("jobs.json")
}

/// Get the config directory path (e.g., ~/.config/crosswire/)
/// Falls back to current directory if XDG directories unavailable
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
