//! Kernel configuration from the boot command line.
//!
//! Parsed once at boot; unknown keys are ignored so loaders can pass extra
//! options through to init.

use log::LevelFilter;

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// `loglevel=` -- serial log verbosity.
    pub loglevel: LevelFilter,
    /// `init=` -- path of the first user process.
    pub init_path: &'static str,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            loglevel: LevelFilter::Info,
            init_path: "/sbin/init",
        }
    }
}

impl KernelConfig {
    pub fn parse(cmdline: &'static str) -> Self {
        let mut config = Self::default();
        for word in cmdline.split_whitespace() {
            if let Some(level) = word.strip_prefix("loglevel=") {
                config.loglevel = match level {
                    "off" | "0" => LevelFilter::Off,
                    "error" | "1" => LevelFilter::Error,
                    "warn" | "2" => LevelFilter::Warn,
                    "info" | "3" => LevelFilter::Info,
                    "debug" | "4" => LevelFilter::Debug,
                    "trace" | "5" => LevelFilter::Trace,
                    _ => config.loglevel,
                };
            } else if let Some(path) = word.strip_prefix("init=") {
                config.init_path = path;
            }
        }
        config
    }
}

static CONFIG: spin::Once<KernelConfig> = spin::Once::new();

/// Parse and publish the configuration. First caller wins.
pub fn init(cmdline: &'static str) -> &'static KernelConfig {
    CONFIG.call_once(|| KernelConfig::parse(cmdline))
}

pub fn config() -> &'static KernelConfig {
    CONFIG.call_once(KernelConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_keys() {
        let config = KernelConfig::parse("loglevel=debug init=/bin/sh quiet");
        assert_eq!(config.loglevel, LevelFilter::Debug);
        assert_eq!(config.init_path, "/bin/sh");
    }

    #[test]
    fn defaults_survive_garbage() {
        let config = KernelConfig::parse("loglevel=purple");
        assert_eq!(config, KernelConfig::default());
    }
}
