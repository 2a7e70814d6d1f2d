use std::path::PathBuf;
use thiserror::Error;

use crate::layout::Layout;
use crate::store::auth::Credentials;

/// Holds configuration data passed in by the user.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub bucket: Option<String>,
    pub key_prefix: Option<String>,
    pub json_credentials: Option<PathBuf>,
    pub device_size: Option<u64>,
    pub object_size: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown parameter {0}")]
    UnknownParameter(String),

    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("bucket parameter missing")]
    MissingBucket,

    #[error("key parameter missing")]
    MissingKey,

    #[error("`size` and `object-size` parameters must always be specified together")]
    UnpairedSizes,

    #[error("`size` and `object-size` must not be zero")]
    ZeroSize,

    #[error("`size` must be a multiple of `object-size`")]
    NotAMultiple,
}

impl Config {
    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "bucket" => self.bucket = Some(value.to_owned()),
            "key" => self.key_prefix = Some(value.to_owned()),
            "json-credentials" | "json_credentials" => {
                self.json_credentials = Some(PathBuf::from(value));
            }
            "size" => self.device_size = Some(parse_size(value)?),
            "object-size" | "object_size" => self.object_size = Some(parse_size(value)?),
            _ => return Err(ConfigError::UnknownParameter(key.to_owned())),
        }
        Ok(())
    }

    /// Validate configuration settings, once all of them have been set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.is_none() {
            return Err(ConfigError::MissingBucket);
        }
        if self.key_prefix.is_none() {
            return Err(ConfigError::MissingKey);
        }

        match (self.device_size, self.object_size) {
            (None, None) => Ok(()),
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::UnpairedSizes),
            (Some(device_size), Some(object_size)) => {
                if device_size == 0 || object_size == 0 {
                    Err(ConfigError::ZeroSize)
                } else if device_size % object_size != 0 {
                    Err(ConfigError::NotAMultiple)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The device geometry, or `None` in single-object mode.
    pub fn layout(&self) -> Option<Layout> {
        match (self.object_size, self.device_size) {
            (Some(object_size), Some(device_size)) => Some(Layout {
                object_size,
                device_size,
            }),
            _ => None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        match &self.json_credentials {
            Some(path) => Credentials::JsonFile(path.clone()),
            None => Credentials::Default,
        }
    }
}

/// Parse a byte count, accepting a single binary suffix ("64k", "1M", ...).
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let err = || ConfigError::InvalidSize(value.to_owned());

    let (digits, shift) = match value.char_indices().last().ok_or_else(err)? {
        (pos, 'k') | (pos, 'K') => (&value[..pos], 10),
        (pos, 'm') | (pos, 'M') => (&value[..pos], 20),
        (pos, 'g') | (pos, 'G') => (&value[..pos], 30),
        (pos, 't') | (pos, 'T') => (&value[..pos], 40),
        (pos, 'p') | (pos, 'P') => (&value[..pos], 50),
        (pos, 'e') | (pos, 'E') => (&value[..pos], 60),
        _ => (value, 0),
    };
    let number: u64 = digits.parse().map_err(|_| err())?;
    number.checked_shl(shift).filter(|n| n >> shift == number).ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::{parse_size, Config, ConfigError};

    fn configured(pairs: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (key, value) in pairs {
            config.set(key, value).unwrap();
        }
        config
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("3M").unwrap(), 3 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("2T").unwrap(), 2u64 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("12q").is_err());
        assert!(parse_size("k").is_err());
        assert!(parse_size("99999999999E").is_err());
    }

    #[test]
    fn test_unknown_parameter() {
        let mut config = Config::default();
        match config.set("buckets", "b") {
            Err(ConfigError::UnknownParameter(key)) => assert_eq!(key, "buckets"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_minimal() {
        let config = configured(&[("bucket", "b"), ("key", "dev0")]);
        config.validate().unwrap();
        assert!(config.layout().is_none());
    }

    #[test]
    fn test_validate_full() {
        let config = configured(&[
            ("bucket", "b"),
            ("key", "dev0"),
            ("size", "320"),
            ("object-size", "16"),
        ]);
        config.validate().unwrap();
        let layout = config.layout().unwrap();
        assert_eq!(layout.object_size, 16);
        assert_eq!(layout.device_size, 320);
    }

    #[test]
    fn test_validate_missing_required() {
        assert!(matches!(
            configured(&[("key", "dev0")]).validate(),
            Err(ConfigError::MissingBucket),
        ));
        assert!(matches!(
            configured(&[("bucket", "b")]).validate(),
            Err(ConfigError::MissingKey),
        ));
    }

    #[test]
    fn test_validate_size_pairing() {
        let config = configured(&[("bucket", "b"), ("key", "dev0"), ("size", "320")]);
        assert!(matches!(config.validate(), Err(ConfigError::UnpairedSizes)));

        let config = configured(&[("bucket", "b"), ("key", "dev0"), ("object-size", "16")]);
        assert!(matches!(config.validate(), Err(ConfigError::UnpairedSizes)));
    }

    #[test]
    fn test_validate_multiple() {
        let config = configured(&[
            ("bucket", "b"),
            ("key", "dev0"),
            ("size", "321"),
            ("object-size", "16"),
        ]);
        assert!(matches!(config.validate(), Err(ConfigError::NotAMultiple)));
    }

    #[test]
    fn test_underscore_aliases() {
        let config = configured(&[
            ("bucket", "b"),
            ("key", "dev0"),
            ("size", "32"),
            ("object_size", "16"),
            ("json_credentials", "/tmp/creds.json"),
        ]);
        config.validate().unwrap();
        assert!(config.json_credentials.is_some());
    }
}
