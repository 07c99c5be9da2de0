//! Service settings parsing.

use crate::{ConfigError, ConfigResult};
use buildhook_core::split_list;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Settings shared by the server, the workers and the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub general: GeneralSettings,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Name of this installation, shown in logs.
    pub name: String,
    /// Directory holding one checkout per project.
    pub build_root: PathBuf,
    /// Queues a worker subscribes to when none are given on the command line.
    pub build_queues: Vec<String>,
    /// Script run inside the project directory.
    pub build_script: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            name: "buildhook".to_string(),
            build_root: PathBuf::from("/var/lib/buildhook/projects"),
            build_queues: Vec::new(),
            build_script: "./do_build".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `postgres://...`, or `memory:` for a process-local store.
    pub url: String,
    pub max_connections: u32,
    /// How long an idle worker waits before polling the queue again.
    pub poll_interval: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "postgres://buildhook@localhost/buildhook".to_string(),
            max_connections: 10,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// The standard settings files, lowest precedence first.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("/etc/buildhook/defaults.kdl"),
            PathBuf::from("/etc/buildhook/site.kdl"),
        ];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(Path::new(&home).join(".buildhook.kdl"));
        }
        paths
    }

    /// Load settings from `paths` in order, skipping files that do not exist.
    pub fn load(paths: &[PathBuf]) -> ConfigResult<Settings> {
        let mut settings = Settings::default();
        for path in paths {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: path.clone(),
                        source,
                    });
                }
            };
            settings.apply_kdl(&content)?;
        }
        Ok(settings)
    }

    /// Load `explicit` alone when given, otherwise the standard layered files.
    ///
    /// Unlike the layered files, an explicit file must exist.
    pub fn load_from(explicit: Option<&Path>) -> ConfigResult<Settings> {
        let Some(path) = explicit else {
            return Settings::load(&Settings::default_paths());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Settings::parse(&content)
    }

    /// Parse a single settings document on top of the defaults.
    pub fn parse(kdl: &str) -> ConfigResult<Settings> {
        let mut settings = Settings::default();
        settings.apply_kdl(kdl)?;
        Ok(settings)
    }

    /// Override the values present in `kdl`.
    pub fn apply_kdl(&mut self, kdl: &str) -> ConfigResult<()> {
        let doc: KdlDocument = kdl.parse()?;

        for node in doc.nodes() {
            match node.name().value() {
                "general" => self.apply_general(node)?,
                "store" => self.apply_store(node)?,
                "server" => self.apply_server(node)?,
                "log" => self.apply_log(node)?,
                _ => {} // Ignore unknown sections
            }
        }

        Ok(())
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn apply_general(&mut self, node: &KdlNode) -> ConfigResult<()> {
        for child in children(node) {
            match child.name().value() {
                "name" => self.general.name = required_string(child, "general.name")?,
                "build-root" => {
                    self.general.build_root =
                        PathBuf::from(required_string(child, "general.build-root")?);
                }
                "build-queues" => {
                    self.general.build_queues = get_all_string_args(child)
                        .iter()
                        .flat_map(|arg| split_list(arg))
                        .collect();
                }
                "build-script" => {
                    self.general.build_script = required_string(child, "general.build-script")?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_store(&mut self, node: &KdlNode) -> ConfigResult<()> {
        for child in children(node) {
            match child.name().value() {
                "url" => self.store.url = required_string(child, "store.url")?,
                "max-connections" => {
                    self.store.max_connections = required_int(child, "store.max-connections")?;
                }
                "poll-interval-ms" => {
                    let ms: u64 = required_int(child, "store.poll-interval-ms")?;
                    self.store.poll_interval = Duration::from_millis(ms);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_server(&mut self, node: &KdlNode) -> ConfigResult<()> {
        for child in children(node) {
            match child.name().value() {
                "host" => self.server.host = required_string(child, "server.host")?,
                "port" => self.server.port = required_int(child, "server.port")?,
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_log(&mut self, node: &KdlNode) -> ConfigResult<()> {
        for child in children(node) {
            if child.name().value() == "level" {
                let level = required_string(child, "log.level")?.to_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(ConfigError::InvalidValue {
                        field: "log.level".to_string(),
                        message: format!("unknown level '{}'", level),
                    });
                }
                self.log.level = level;
            }
        }
        Ok(())
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes().iter())
        .into_iter()
        .flatten()
}

fn get_first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a string".to_string(),
        })
}

fn required_int<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    let value = get_first_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?
        .as_integer()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected an integer".to_string(),
        })?;
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.general.build_script, "./do_build");
        assert_eq!(settings.store.max_connections, 10);
        assert_eq!(settings.listen_addr(), "127.0.0.1:5000");
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_parse_full_settings() {
        let kdl = r#"
            general {
                name "ci-east"
                build-root "/srv/builds"
                build-queues "linux, docs"
                build-script "./ci.sh"
            }
            store {
                url "memory:"
                max-connections 4
                poll-interval-ms 250
            }
            server {
                host "0.0.0.0"
                port 8080
            }
            log {
                level "DEBUG"
            }
        "#;

        let settings = Settings::parse(kdl).unwrap();
        assert_eq!(settings.general.name, "ci-east");
        assert_eq!(settings.general.build_root, PathBuf::from("/srv/builds"));
        assert_eq!(settings.general.build_queues, vec!["linux", "docs"]);
        assert_eq!(settings.general.build_script, "./ci.sh");
        assert_eq!(settings.store.url, "memory:");
        assert_eq!(settings.store.max_connections, 4);
        assert_eq!(settings.store.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.listen_addr(), "0.0.0.0:8080");
        assert_eq!(settings.log.level, "debug");
    }

    #[test]
    fn test_invalid_values() {
        let result = Settings::parse("server {\n port 70000\n}");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = Settings::parse("server {\n port \"eighty\"\n}");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = Settings::parse("log {\n level \"loud\"\n}");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = Settings::parse("store {\n url\n}");
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_layered_load() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = dir.path().join("defaults.kdl");
        let site = dir.path().join("site.kdl");
        std::fs::write(
            &defaults,
            "general {\n name \"base\"\n build-queues \"a\"\n}\nserver {\n port 9000\n}",
        )
        .unwrap();
        std::fs::write(&site, "general {\n build-queues \"b, c\"\n}").unwrap();

        let paths = vec![defaults, dir.path().join("missing.kdl"), site];
        let settings = Settings::load(&paths).unwrap();
        assert_eq!(settings.general.name, "base");
        assert_eq!(settings.general.build_queues, vec!["b", "c"]);
        assert_eq!(settings.server.port, 9000);
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("buildhook.kdl");
        assert!(matches!(
            Settings::load_from(Some(missing.as_path())),
            Err(ConfigError::Io { .. })
        ));

        std::fs::write(&missing, "store {\n url \"memory:\"\n}").unwrap();
        let settings = Settings::load_from(Some(missing.as_path())).unwrap();
        assert_eq!(settings.store.url, "memory:");
    }
}
