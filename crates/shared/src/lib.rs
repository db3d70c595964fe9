pub mod events;
pub mod queue;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn default_max_queue_size() -> usize {
        50
    }

    fn default_upload_timeout_ms() -> u64 {
        30_000
    }

    fn default_log_filter() -> String {
        "info".to_string()
    }

    /// Limits for a single chat session's send queue.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QueueSettings {
        /// Messages beyond this many queued turns are rejected
        #[serde(default = "default_max_queue_size")]
        pub max_queue_size: usize,
        /// Uploads that neither complete nor fail within this window are failed
        #[serde(default = "default_upload_timeout_ms")]
        pub upload_timeout_ms: u64,
    }

    impl QueueSettings {
        pub fn upload_timeout(&self) -> Duration {
            Duration::from_millis(self.upload_timeout_ms)
        }

        pub fn with_max_queue_size(mut self, max: usize) -> Self {
            self.max_queue_size = max;
            self
        }

        pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
            self.upload_timeout_ms = timeout.as_millis() as u64;
            self
        }
    }

    impl Default for QueueSettings {
        fn default() -> Self {
            Self {
                max_queue_size: default_max_queue_size(),
                upload_timeout_ms: default_upload_timeout_ms(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AppSettings {
        #[serde(default)]
        pub queue: QueueSettings,
        /// `tracing` filter used when RUST_LOG is unset
        #[serde(default = "default_log_filter")]
        pub log_filter: String,
    }

    impl Default for AppSettings {
        fn default() -> Self {
            Self {
                queue: QueueSettings::default(),
                log_filter: default_log_filter(),
            }
        }
    }

    impl AppSettings {
        /// Read settings from a JSON file. Missing fields take their defaults.
        pub fn load(path: &Path) -> Result<Self, SettingsError> {
            let bytes = fs::read(path)?;
            Ok(serde_json::from_slice(&bytes)?)
        }

        pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_vec_pretty(self)?)?;
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("Failed to access settings file: {0}")]
        Io(#[from] std::io::Error),

        #[error("Invalid settings file: {0}")]
        Parse(#[from] serde_json::Error),
    }

}
