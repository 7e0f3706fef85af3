use super::models::Config;
use crate::humanize::{ByteSize, HumanDuration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Feed name '{name}' must only use letters, digits, '.', '_' or '-'")]
    InvalidFeedName { name: String },

    #[error("Feed '{name}' has an invalid url '{url}'")]
    InvalidFeedUrl { name: String, url: String },

    #[error("feed.max_new_per_poll must be at least 1")]
    InvalidNewEntryCap,

    #[error("build.soft_age ({soft}) exceeds build.hard_age ({hard})")]
    AgeThresholdsInverted { soft: HumanDuration, hard: HumanDuration },

    #[error("build.soft_size ({soft}) exceeds build.hard_size ({hard})")]
    SizeThresholdsInverted { soft: ByteSize, hard: ByteSize },

    #[error("build.hard_size ({hard}) must be below build.max_size ({max})")]
    HardSizeUnreachable { hard: ByteSize, max: ByteSize },

    #[error("Interval must be non-zero: {field}")]
    ZeroInterval { field: &'static str },

    #[error("Setting must not be empty: {field}")]
    EmptySetting { field: &'static str },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_feeds(config)?;
    validate_build(config)?;
    validate_intervals(config)?;
    validate_programs(config)?;
    Ok(())
}

/// Feed names become part of file names in the working directory
pub fn is_valid_feed_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn validate_feeds(config: &Config) -> Result<(), ValidationError> {
    for (name, feed) in &config.feeds {
        if !is_valid_feed_name(name) {
            return Err(ValidationError::InvalidFeedName { name: name.clone() });
        }
        if reqwest::Url::parse(&feed.url).is_err() {
            return Err(ValidationError::InvalidFeedUrl {
                name: name.clone(),
                url: feed.url.clone(),
            });
        }
    }

    if config.feed.max_new_per_poll == 0 {
        return Err(ValidationError::InvalidNewEntryCap);
    }

    Ok(())
}

fn validate_build(config: &Config) -> Result<(), ValidationError> {
    let build = &config.build;

    if build.soft_age > build.hard_age {
        return Err(ValidationError::AgeThresholdsInverted {
            soft: build.soft_age,
            hard: build.hard_age,
        });
    }

    if build.soft_size > build.hard_size {
        return Err(ValidationError::SizeThresholdsInverted {
            soft: build.soft_size,
            hard: build.hard_size,
        });
    }

    // The candidate batch always stays below max_size
    if build.hard_size >= build.max_size {
        return Err(ValidationError::HardSizeUnreachable {
            hard: build.hard_size,
            max: build.max_size,
        });
    }

    Ok(())
}

fn validate_intervals(config: &Config) -> Result<(), ValidationError> {
    let intervals = [
        ("feed.interval", config.feed.interval),
        ("fetch.interval", config.fetch.interval),
        ("build.interval", config.build.interval),
        ("burn.interval", config.burn.interval),
        ("controller.pump_interval", config.controller.pump_interval),
    ];

    for (field, value) in intervals {
        if value.as_duration().is_zero() {
            return Err(ValidationError::ZeroInterval { field });
        }
    }

    Ok(())
}

fn validate_programs(config: &Config) -> Result<(), ValidationError> {
    let settings = [
        ("build.program", &config.build.program),
        ("burn.device", &config.burn.device),
        ("burn.probe_program", &config.burn.probe_program),
        ("burn.eject_program", &config.burn.eject_program),
        ("burn.burn_program", &config.burn.burn_program),
        ("log_file", &config.log_file),
    ];

    for (field, value) in settings {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptySetting { field });
        }
    }

    Ok(())
}
