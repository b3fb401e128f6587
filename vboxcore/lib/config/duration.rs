use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::VboxcoreError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A duration written the way operators write it in configuration files.
///
/// ## Format
/// A non-negative integer followed by one of the units `ms`, `s`, `m` or `h`. A bare integer is
/// read as seconds.
///
/// ## Examples
///
/// ```
/// use std::time::Duration;
/// use vboxcore::config::ConfigDuration;
///
/// let timeout = "15m".parse::<ConfigDuration>().unwrap();
/// assert_eq!(timeout.get(), Duration::from_secs(15 * 60));
///
/// let cadence = "500ms".parse::<ConfigDuration>().unwrap();
/// assert_eq!(cadence.to_string(), "500ms");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDuration(Duration);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConfigDuration {
    /// Wraps a [`Duration`].
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Returns the wrapped [`Duration`].
    pub const fn get(&self) -> Duration {
        self.0
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ConfigDuration {
    type Err = VboxcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VboxcoreError::Config(format!("invalid duration: {s:?}"));

        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (value, unit) = trimmed.split_at(split);
        if value.is_empty() {
            return Err(invalid());
        }

        let value: u64 = value.parse().map_err(|_| invalid())?;
        let duration = match unit.trim() {
            "ms" => Duration::from_millis(value),
            "" | "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(60 * 60).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };

        Ok(Self(duration))
    }
}

impl fmt::Display for ConfigDuration {
    /// Formats the duration with the largest unit that represents it exactly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 != 0 {
            return write!(f, "{millis}ms");
        }

        let secs = self.0.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl From<Duration> for ConfigDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(duration: ConfigDuration) -> Self {
        duration.0
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_duration_from_str() {
        assert_eq!(
            "500ms".parse::<ConfigDuration>().unwrap().get(),
            Duration::from_millis(500)
        );
        assert_eq!(
            "10s".parse::<ConfigDuration>().unwrap().get(),
            Duration::from_secs(10)
        );
        assert_eq!(
            "10".parse::<ConfigDuration>().unwrap().get(),
            Duration::from_secs(10)
        );
        assert_eq!(
            "15m".parse::<ConfigDuration>().unwrap().get(),
            Duration::from_secs(900)
        );
        assert_eq!(
            "1h".parse::<ConfigDuration>().unwrap().get(),
            Duration::from_secs(3600)
        );

        assert!("".parse::<ConfigDuration>().is_err());
        assert!("ms".parse::<ConfigDuration>().is_err());
        assert!("-5s".parse::<ConfigDuration>().is_err());
        assert!("5d".parse::<ConfigDuration>().is_err());
        assert!("1.5s".parse::<ConfigDuration>().is_err());
    }

    #[test]
    fn test_config_duration_display() {
        assert_eq!(ConfigDuration::new(Duration::from_millis(1500)).to_string(), "1500ms");
        assert_eq!(ConfigDuration::new(Duration::from_secs(45)).to_string(), "45s");
        assert_eq!(ConfigDuration::new(Duration::from_secs(120)).to_string(), "2m");
        assert_eq!(ConfigDuration::new(Duration::from_secs(7200)).to_string(), "2h");
        assert_eq!(ConfigDuration::new(Duration::ZERO).to_string(), "0s");
    }
}
