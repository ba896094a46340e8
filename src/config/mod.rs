//! Configuration Management Module
//!
//! Multiplexer settings (reconnect policy, connect timeouts, layout limits,
//! proxy-jump profiles) and their on-disk storage.

pub mod settings;
pub mod storage;

pub use settings::{ConnectSettings, LayoutSettings, MuxSettings, SETTINGS_VERSION};
pub use storage::{config_dir, log_dir, settings_file, SettingsStorage, StorageError};
