use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Shared directory holding every queue, endpoint record and the log
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Log file name, relative to `working_dir`
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Feed endpoints seeded into the working directory at startup
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedEndpointConfig>,
    #[serde(default)]
    pub feed: FeedCheckConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub burn: BurnConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            log_file: default_log_file(),
            feeds: BTreeMap::new(),
            feed: FeedCheckConfig::default(),
            fetch: FetchConfig::default(),
            build: BuildConfig::default(),
            burn: BurnConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl Config {
    /// Working directory with a leading `~` expanded to `$HOME`
    pub fn resolved_working_dir(&self) -> PathBuf {
        expand_home(&self.working_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.resolved_working_dir().join(&self.log_file)
    }
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("~/audrey-working")
}

fn default_log_file() -> String {
    "log".to_string()
}

/// A feed declared in the configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedEndpointConfig {
    pub url: String,
}

/// Feed polling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedCheckConfig {
    #[serde(default = "default_feed_interval")]
    pub interval: HumanDuration,
    #[serde(default = "default_feed_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Cap on descriptors published per endpoint per poll
    #[serde(default = "default_max_new_per_poll")]
    pub max_new_per_poll: usize,
    /// First successful poll only records the newest entry timestamp
    #[serde(default = "default_true")]
    pub prime_on_first_poll: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_feed_title_len")]
    pub feed_title_len: usize,
    #[serde(default = "default_entry_title_len")]
    pub entry_title_len: usize,
}

impl Default for FeedCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_feed_interval(),
            timeout: default_feed_timeout(),
            user_agent: default_user_agent(),
            max_new_per_poll: default_max_new_per_poll(),
            prime_on_first_poll: true,
            max_redirects: default_max_redirects(),
            feed_title_len: default_feed_title_len(),
            entry_title_len: default_entry_title_len(),
        }
    }
}

fn default_feed_interval() -> HumanDuration {
    HumanDuration::secs(60 * 60)
}

fn default_feed_timeout() -> HumanDuration {
    HumanDuration::secs(60)
}

fn default_user_agent() -> String {
    "Audrey/0.1".to_string()
}

fn default_max_new_per_poll() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    10
}

fn default_feed_title_len() -> usize {
    16
}

fn default_entry_title_len() -> usize {
    15
}

/// Media download
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_interval")]
    pub interval: HumanDuration,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_fetch_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            interval: default_fetch_interval(),
            connect_timeout: default_connect_timeout(),
            timeout: default_fetch_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_fetch_interval() -> HumanDuration {
    HumanDuration::secs(60)
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::secs(10)
}

fn default_fetch_timeout() -> HumanDuration {
    HumanDuration::secs(60 * 60)
}

fn default_max_retries() -> u32 {
    3
}

/// Image batching thresholds.
///
/// Build when both soft limits are passed, or either hard limit is passed.
/// `max_size` bounds the selected batch and is never reached.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_interval")]
    pub interval: HumanDuration,
    #[serde(default = "default_soft_age")]
    pub soft_age: HumanDuration,
    #[serde(default = "default_soft_size")]
    pub soft_size: ByteSize,
    #[serde(default = "default_hard_age")]
    pub hard_age: HumanDuration,
    #[serde(default = "default_hard_size")]
    pub hard_size: ByteSize,
    #[serde(default = "default_max_size")]
    pub max_size: ByteSize,
    #[serde(default = "default_image_program")]
    pub program: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            interval: default_build_interval(),
            soft_age: default_soft_age(),
            soft_size: default_soft_size(),
            hard_age: default_hard_age(),
            hard_size: default_hard_size(),
            max_size: default_max_size(),
            program: default_image_program(),
        }
    }
}

fn default_build_interval() -> HumanDuration {
    HumanDuration::secs(1)
}

fn default_soft_age() -> HumanDuration {
    HumanDuration::days(7)
}

fn default_soft_size() -> ByteSize {
    ByteSize::mib(400)
}

fn default_hard_age() -> HumanDuration {
    HumanDuration::days(14)
}

fn default_hard_size() -> ByteSize {
    ByteSize::mib(550)
}

fn default_max_size() -> ByteSize {
    ByteSize::mib(600)
}

fn default_image_program() -> String {
    "genisoimage".to_string()
}

/// Disc drive and burner
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BurnConfig {
    #[serde(default = "default_burn_interval")]
    pub interval: HumanDuration,
    /// Wait after retracting the tray before probing
    #[serde(default = "default_settle")]
    pub settle: HumanDuration,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default = "default_probe_program")]
    pub probe_program: String,
    #[serde(default = "default_eject_program")]
    pub eject_program: String,
    #[serde(default = "default_burn_program")]
    pub burn_program: String,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            interval: default_burn_interval(),
            settle: default_settle(),
            device: default_device(),
            speed: default_speed(),
            probe_program: default_probe_program(),
            eject_program: default_eject_program(),
            burn_program: default_burn_program(),
        }
    }
}

fn default_burn_interval() -> HumanDuration {
    HumanDuration::millis(500)
}

fn default_settle() -> HumanDuration {
    HumanDuration::secs(4)
}

fn default_device() -> String {
    "/dev/cdrw".to_string()
}

fn default_speed() -> u32 {
    10
}

fn default_probe_program() -> String {
    "cd-info".to_string()
}

fn default_eject_program() -> String {
    "eject".to_string()
}

fn default_burn_program() -> String {
    "wodim".to_string()
}

/// Front-end pump loop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    #[serde(default = "default_pump_interval")]
    pub pump_interval: HumanDuration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pump_interval: default_pump_interval(),
        }
    }
}

fn default_pump_interval() -> HumanDuration {
    HumanDuration::millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.log_file, "log");
        assert_eq!(config.feed.max_new_per_poll, 3);
        assert_eq!(config.build.max_size, ByteSize::mib(600));
        assert_eq!(config.build.hard_age, HumanDuration::days(14));
        assert_eq!(config.burn.device, "/dev/cdrw");
        assert!(config.feed.prime_on_first_poll);
    }

    #[test]
    fn test_absolute_working_dir_untouched() {
        let config = Config {
            working_dir: PathBuf::from("/srv/audrey"),
            ..Config::default()
        };
        assert_eq!(config.resolved_working_dir(), PathBuf::from("/srv/audrey"));
        assert_eq!(config.log_path(), PathBuf::from("/srv/audrey/log"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
working_dir = "/tmp/audrey"

[feeds.news]
url = "https://example.com/news.xml"

[build]
soft_size = "100MB"
hard_age = "3d"
"#,
        )
        .unwrap();

        assert_eq!(config.feeds["news"].url, "https://example.com/news.xml");
        assert_eq!(config.build.soft_size, ByteSize::mib(100));
        assert_eq!(config.build.hard_age, HumanDuration::days(3));
        assert_eq!(config.build.max_size, ByteSize::mib(600));
    }
}
