//! Configuration types.
//!
//! Everything is read from environment variables once at startup and
//! validated before any loop starts. Defaults match a typical cold-outreach
//! cadence: initial send a minute after enrolment, follow-ups at 14 and 10
//! days, 30 sends a minute.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatch::RetryPolicy;
use crate::error::ConfigError;
use crate::limiter::{self, LimiterConfig};
use crate::mail::{GraphConfig, ImapConfig, SmtpConfig};
use crate::scheduler::SchedulerConfig;
use crate::sequence::SequencePlan;

/// Longest accepted stage delay.
const MAX_DELAY_DAYS: u64 = 3650;

const DEFAULT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Which provider sends mail and reads the inbox.
#[derive(Debug, Clone)]
pub enum MailBackendConfig {
    /// Graph-style REST API for both directions.
    Graph(GraphConfig),
    /// SMTP relay for sending, IMAP for the inbox.
    Smtp { smtp: SmtpConfig, imap: ImapConfig },
}

impl MailBackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Graph(_) => "graph",
            Self::Smtp { .. } => "smtp",
        }
    }
}

/// Sequencer configuration.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub db_path: PathBuf,
    pub template_dir: PathBuf,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    /// Our sending address. Inbound mail from it is never a reply.
    pub sender_email: String,

    pub initial_delay_secs: u64,
    pub follow_up_1_delay_days: u64,
    pub follow_up_2_enabled: bool,
    pub follow_up_2_delay_days: u64,
    /// Reply window after the last email before the sequence completes.
    pub completion_window_days: u64,

    pub retry_ceiling: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_jitter: f64,

    pub rate_limit_per_minute: u32,
    pub rate_limit_per_day: u32,
    pub rate_limit_recovery_secs: u64,
    pub rate_limit_cooldown_secs: u64,

    pub reply_check_interval_minutes: u64,
    pub scheduler_tick_secs: u64,
    /// Per-send and per-fetch timeout.
    pub send_timeout_secs: u64,
    pub send_concurrency: usize,
    /// `0` disables the operator API.
    pub api_port: u16,
    /// Extra auto-reply subject regexes.
    pub auto_reply_patterns: Vec<String>,

    pub backend: MailBackendConfig,
}

impl SequencerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let sender_email = env.required("SENDER_EMAIL")?;
        let send_timeout_secs = env.parse("SEND_TIMEOUT_SECS", 30)?;
        let timeout = Duration::from_secs(send_timeout_secs);

        let backend = match env
            .string("MAIL_BACKEND", "graph")
            .to_ascii_lowercase()
            .as_str()
        {
            "graph" => MailBackendConfig::Graph(GraphConfig {
                api_base: env.string("GRAPH_API_BASE", DEFAULT_GRAPH_API_BASE),
                access_token: SecretString::from(env.required("GRAPH_ACCESS_TOKEN")?),
                sender_email: sender_email.clone(),
                timeout,
            }),
            "smtp" => {
                let smtp_host = env.required("SMTP_HOST")?;
                let smtp_username = env.string("SMTP_USERNAME", &sender_email);
                let smtp_password = env.required("SMTP_PASSWORD")?;
                let imap_host = env.string("IMAP_HOST", &smtp_host.replace("smtp", "imap"));
                let imap_username = env.string("IMAP_USERNAME", &smtp_username);
                let imap_password = env.string("IMAP_PASSWORD", &smtp_password);
                MailBackendConfig::Smtp {
                    smtp: SmtpConfig {
                        host: smtp_host,
                        port: env.parse("SMTP_PORT", 587)?,
                        username: smtp_username,
                        password: SecretString::from(smtp_password),
                        from_address: sender_email.clone(),
                        timeout,
                    },
                    imap: ImapConfig {
                        host: imap_host,
                        port: env.parse("IMAP_PORT", 993)?,
                        username: imap_username,
                        password: SecretString::from(imap_password),
                        timeout,
                    },
                }
            }
            other => {
                return Err(ConfigError::invalid(
                    "MAIL_BACKEND",
                    format!("unknown backend '{other}' (expected graph or smtp)"),
                ));
            }
        };

        let config = Self {
            db_path: PathBuf::from(env.string("SEQUENCER_DB_PATH", "./data/sequencer.db")),
            template_dir: PathBuf::from(env.string("TEMPLATE_DIR", "./templates")),
            log_dir: env.optional("SEQUENCER_LOG_DIR").map(PathBuf::from),
            sender_email,
            initial_delay_secs: env.parse("INITIAL_DELAY_SECS", 60)?,
            follow_up_1_delay_days: env.parse("FOLLOW_UP_1_DELAY_DAYS", 14)?,
            follow_up_2_enabled: env.flag("FOLLOW_UP_2_ENABLED", true)?,
            follow_up_2_delay_days: env.parse("FOLLOW_UP_2_DELAY_DAYS", 10)?,
            completion_window_days: env.parse("COMPLETION_WINDOW_DAYS", 10)?,
            retry_ceiling: env.parse("RETRY_CEILING", 3)?,
            retry_base_delay_secs: env.parse("RETRY_BASE_DELAY_SECS", 300)?,
            retry_max_delay_secs: env.parse("RETRY_MAX_DELAY_SECS", 86_400)?,
            retry_jitter: env.parse("RETRY_JITTER", 0.1)?,
            rate_limit_per_minute: env.parse("RATE_LIMIT_PER_MINUTE", 30)?,
            rate_limit_per_day: env.parse("RATE_LIMIT_PER_DAY", 10_000)?,
            rate_limit_recovery_secs: env.parse("RATE_LIMIT_RECOVERY_SECS", 60)?,
            rate_limit_cooldown_secs: env.parse("RATE_LIMIT_COOLDOWN_SECS", 120)?,
            reply_check_interval_minutes: env.parse("REPLY_CHECK_INTERVAL_MINUTES", 15)?,
            scheduler_tick_secs: env.parse("SCHEDULER_TICK_SECS", 60)?,
            send_timeout_secs,
            send_concurrency: env.parse("SEND_CONCURRENCY", 4)?,
            api_port: env.parse("SEQUENCER_API_PORT", 8080)?,
            auto_reply_patterns: env.list("AUTO_REPLY_SUBJECT_PATTERNS"),
            backend,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Called by the loaders; exposed for configs built
    /// in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sender_email.contains('@') {
            return Err(ConfigError::invalid("SENDER_EMAIL", "must be an email address"));
        }

        let positive: [(&str, u64); 7] = [
            ("RATE_LIMIT_PER_MINUTE", self.rate_limit_per_minute.into()),
            ("RATE_LIMIT_PER_DAY", self.rate_limit_per_day.into()),
            ("RETRY_CEILING", self.retry_ceiling.into()),
            ("REPLY_CHECK_INTERVAL_MINUTES", self.reply_check_interval_minutes),
            ("SCHEDULER_TICK_SECS", self.scheduler_tick_secs),
            ("SEND_TIMEOUT_SECS", self.send_timeout_secs),
            ("SEND_CONCURRENCY", self.send_concurrency as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        let delays = [
            ("INITIAL_DELAY_SECS", self.initial_delay_secs / 86_400),
            ("FOLLOW_UP_1_DELAY_DAYS", self.follow_up_1_delay_days),
            ("FOLLOW_UP_2_DELAY_DAYS", self.follow_up_2_delay_days),
            ("COMPLETION_WINDOW_DAYS", self.completion_window_days),
            ("RETRY_MAX_DELAY_SECS", self.retry_max_delay_secs / 86_400),
        ];
        for (key, days) in delays {
            if days > MAX_DELAY_DAYS {
                return Err(ConfigError::invalid(
                    key,
                    format!("must not exceed {MAX_DELAY_DAYS} days"),
                ));
            }
        }

        let max_interval = limiter::MAX_INTERVAL.as_secs();
        let limiter_intervals = [
            ("RATE_LIMIT_RECOVERY_SECS", self.rate_limit_recovery_secs),
            ("RATE_LIMIT_COOLDOWN_SECS", self.rate_limit_cooldown_secs),
        ];
        for (key, secs) in limiter_intervals {
            if secs > max_interval {
                return Err(ConfigError::invalid(
                    key,
                    format!("must not exceed {max_interval} seconds"),
                ));
            }
        }

        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::invalid("RETRY_JITTER", "must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn sequence_plan(&self) -> SequencePlan {
        SequencePlan {
            initial_delay: chrono::Duration::seconds(clamp_i64(self.initial_delay_secs)),
            follow_up_1_delay: chrono::Duration::days(clamp_i64(self.follow_up_1_delay_days)),
            follow_up_2_enabled: self.follow_up_2_enabled,
            follow_up_2_delay: chrono::Duration::days(clamp_i64(self.follow_up_2_delay_days)),
            completion_window: chrono::Duration::days(clamp_i64(self.completion_window_days)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ceiling: self.retry_ceiling,
            base_delay_secs: self.retry_base_delay_secs,
            max_delay_secs: self.retry_max_delay_secs,
            jitter_factor: self.retry_jitter,
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            per_minute: self.rate_limit_per_minute,
            per_day: self.rate_limit_per_day,
            recovery_interval: Duration::from_secs(self.rate_limit_recovery_secs),
            cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            ..LimiterConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.scheduler_tick_secs),
            reply_check_interval: self.reply_check_interval(),
            send_concurrency: self.send_concurrency,
        }
    }

    pub fn reply_check_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(clamp_i64(self.reply_check_interval_minutes))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value.min(MAX_DELAY_DAYS * 86_400)).unwrap_or(0)
}

/// Typed access to a variable lookup.
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}"))),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::invalid(key, format!("'{other}' is not a boolean"))),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.optional(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
