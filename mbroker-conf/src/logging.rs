use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section: where records go and the lowest level kept.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default", deserialize_with = "deserialize_level")]
    pub level: slog::Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> slog::Level {
        slog::Level::Info
    }
    fn dir_default() -> String {
        "/var/log/mbroker".into()
    }
    fn file_default() -> String {
        "mbroker.log".into()
    }

    /// Full path of the log file, empty when no file is configured
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => format!("{dir}/{file}"),
        }
    }
}

/// Log destination, written in lower case in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

/// Accepts slog level names such as `"debug"`, `"warn"` or `"info"`.
fn deserialize_level<'de, D>(deserializer: D) -> Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    slog::Level::from_str(&level).map_err(|_e| de::Error::custom(format!("unknown log level `{level}`")))
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    fn from_toml(text: &str) -> Result<Log, config::ConfigError> {
        Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()
    }

    #[test]
    fn filename_joins_dir_and_file() {
        let mut log = Log::default();
        assert_eq!(log.filename(), "/var/log/mbroker/mbroker.log");

        log.dir = "/tmp/".into();
        assert_eq!(log.filename(), "/tmp/mbroker.log");

        log.dir.clear();
        assert_eq!(log.filename(), "mbroker.log");

        log.file.clear();
        assert_eq!(log.filename(), "");
    }

    #[test]
    fn targets() {
        assert!(To::Both.file() && To::Both.console());
        assert!(!To::Console.file());
        assert!(To::Off.off());
    }

    #[test]
    fn parses_section() {
        let log = from_toml("to = \"both\"\nlevel = \"debug\"\n").unwrap();
        assert_eq!(log.to, To::Both);
        assert_eq!(log.level, slog::Level::Debug);
        assert_eq!(log.file, "mbroker.log");

        assert!(from_toml("level = \"loud\"\n").is_err());
        assert!(from_toml("to = \"printer\"\n").is_err());
    }
}
