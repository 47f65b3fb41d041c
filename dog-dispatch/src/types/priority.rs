use serde::{Deserialize, Serialize};

/// Job priority (higher values are dequeued first)
///
/// Any integer is a valid priority; the named constants are conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

// Ordering inside a queue: jobs sorted by (Reverse(priority), sequence)
// - Higher priority jobs first
// - Within same priority: earlier enqueue first

impl JobPriority {
    pub const LOW: JobPriority = JobPriority(1);
    pub const NORMAL: JobPriority = JobPriority(5);
    pub const HIGH: JobPriority = JobPriority(10);
    pub const CRITICAL: JobPriority = JobPriority(20);

    /// Get the numeric value for ordering
    pub fn value(self) -> i32 {
        self.0
    }

    /// Human-readable name for the named levels
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::LOW => Some("low"),
            Self::NORMAL => Some("normal"),
            Self::HIGH => Some("high"),
            Self::CRITICAL => Some("critical"),
            _ => None,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::LOW),
            "normal" => Ok(Self::NORMAL),
            "high" => Ok(Self::HIGH),
            "critical" => Ok(Self::CRITICAL),
            other => other
                .parse::<i32>()
                .map(Self)
                .map_err(|_| format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_and_numeric() {
        assert_eq!("HIGH".parse::<JobPriority>().unwrap(), JobPriority::HIGH);
        assert_eq!("-3".parse::<JobPriority>().unwrap(), JobPriority(-3));
        assert!("urgent".parse::<JobPriority>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(JobPriority::CRITICAL.to_string(), "critical");
        assert_eq!(JobPriority(7).to_string(), "7");
    }
}
