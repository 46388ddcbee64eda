//! Filesystem locations

use std::path::PathBuf;

use crate::constants;

/// Root configuration directory (`~/.chatrelay`)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(constants::ui::CONFIG_DIR_NAME)
}

/// Default config file path
pub fn config_file() -> PathBuf {
    config_dir().join(constants::ui::CONFIG_FILE_NAME)
}

/// Log directory
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Token storage directory
pub fn tokens_dir() -> PathBuf {
    config_dir().join("tokens")
}

/// Default SQLite database path
pub fn database_file() -> PathBuf {
    config_dir().join("chats.db")
}
