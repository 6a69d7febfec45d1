//! Runtime settings.
//!
//! Everything has a compiled-in default; environment variables override
//! individual values. Unset variables are ignored, malformed ones are an
//! error rather than silently falling back.

use std::{env, str::FromStr};

use crate::{api::ControllerConfig, error::Error, smbus::BusConfig};

/// All runtime settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub bus: BusConfig,
    pub controller: ControllerConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self {
            bus: BusConfig::from_env()?,
            controller: ControllerConfig::from_env()?,
        })
    }
}

/// Parse environment variable `name`, if set.
pub fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable; the process environment is shared.

    #[test]
    fn unset_is_none() {
        assert_eq!(env_parse::<u32>("PACKCTL_TEST_UNSET").unwrap(), None);
    }

    #[test]
    fn parses_value() {
        env::set_var("PACKCTL_TEST_PARSE", " 25 ");
        assert_eq!(env_parse::<u64>("PACKCTL_TEST_PARSE").unwrap(), Some(25));
    }

    #[test]
    fn malformed_is_error() {
        env::set_var("PACKCTL_TEST_MALFORMED", "soon");
        assert!(matches!(
            env_parse::<u64>("PACKCTL_TEST_MALFORMED"),
            Err(Error::Config(_))
        ));
    }
}
