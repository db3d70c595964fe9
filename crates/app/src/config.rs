use shared::settings::AppSettings;
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com.local", "Sidebar", "Sidebar")
        .map(|proj| proj.config_dir().join("settings.json"))
}

/// Load settings from `explicit` or the default location. Missing or
/// unreadable files fall back to defaults.
pub fn load_settings_or_default(explicit: Option<&Path>) -> AppSettings {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => config_path(),
    };

    match path {
        Some(path) if path.exists() => match AppSettings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("ignoring settings at {}: {}", path.display(), e);
                AppSettings::default()
            }
        },
        _ => AppSettings::default(),
    }
}
