use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub backend_url: String,
    pub max_concurrent_jobs: usize,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub cleanup_enabled: bool,
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// Backend node whose outputs hold the rendered video.
    pub output_node: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_owned(),
            port: 8000,
            backend_url: "http://127.0.0.1:8001".to_owned(),
            max_concurrent_jobs: 1,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(300),
            cleanup_enabled: true,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            output_node: "108".to_owned(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("ignoring unparseable {name}={raw:?}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(name, default.as_secs()))
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

fn env_days(name: &str, default: Duration) -> Duration {
    let days = env_or(name, default.as_secs() / SECS_PER_DAY);
    match days.checked_mul(SECS_PER_DAY) {
        Some(secs) => Duration::from_secs(secs),
        None => {
            warn!("ignoring out-of-range {name}={days}, using default");
            default
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            bind_address: env_or("BIND_ADDRESS", defaults.bind_address),
            port: env_or("PORT", defaults.port),
            backend_url: env_or("BACKEND_URL", defaults.backend_url)
                .trim_end_matches('/')
                .to_owned(),
            max_concurrent_jobs: env_or("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs).max(1),
            upload_dir: env_or("UPLOAD_DIR", defaults.upload_dir),
            output_dir: env_or("OUTPUT_DIR", defaults.output_dir),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            retry_delay: env_secs("RETRY_DELAY_SECS", defaults.retry_delay),
            poll_interval: env_secs("POLL_INTERVAL_SECS", defaults.poll_interval),
            poll_timeout: env_secs("POLL_TIMEOUT_SECS", defaults.poll_timeout),
            cleanup_enabled: env_or("CLEANUP_ENABLED", defaults.cleanup_enabled),
            retention: env_days("RETENTION_DAYS", defaults.retention),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            output_node: env_or("BACKEND_OUTPUT_NODE", defaults.output_node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();

        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.poll_timeout, Duration::from_secs(300));
        assert_eq!(config.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        env::set_var("VIDFLOW_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or("VIDFLOW_TEST_GARBAGE_PORT", 3600u16), 3600);

        env::set_var("VIDFLOW_TEST_GOOD_PORT", " 9000 ");
        assert_eq!(env_or("VIDFLOW_TEST_GOOD_PORT", 3600u16), 9000);

        assert_eq!(env_or("VIDFLOW_TEST_MISSING", 7u32), 7);
    }

    #[test]
    fn retention_days_out_of_range_keep_the_default() {
        let default = Duration::from_secs(7 * SECS_PER_DAY);

        env::set_var("VIDFLOW_TEST_HUGE_DAYS", u64::MAX.to_string());
        assert_eq!(env_days("VIDFLOW_TEST_HUGE_DAYS", default), default);

        env::set_var("VIDFLOW_TEST_TWO_DAYS", "2");
        assert_eq!(
            env_days("VIDFLOW_TEST_TWO_DAYS", default),
            Duration::from_secs(2 * SECS_PER_DAY)
        );
    }
}
