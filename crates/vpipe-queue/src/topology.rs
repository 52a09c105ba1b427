//! Queue topology: consumer groups plus an optional dead-letter stream.

use std::collections::HashMap;
use std::fmt;

/// What a topology declaration managed to set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Main group, dead-letter stream and recorded queue arguments
    DeadLettered,
    /// Main group only; rejected messages are dropped
    Plain,
}

impl Topology {
    pub fn dead_letter_enabled(&self) -> bool {
        matches!(self, Topology::DeadLettered)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::DeadLettered => write!(f, "dead-lettered"),
            Topology::Plain => write!(f, "plain"),
        }
    }
}

/// Hash key recording the arguments a stream was declared with.
pub fn args_key(stream: &str) -> String {
    format!("{}:args", stream)
}

/// Compare recorded queue arguments against the requested ones.
///
/// Returns a description of every mismatch, or `None` when compatible.
/// Arguments missing from the recorded hash are not mismatches.
pub fn compare_args(existing: &HashMap<String, String>, requested: &[(&str, String)]) -> Option<String> {
    let mismatches: Vec<String> = requested
        .iter()
        .filter_map(|(name, value)| match existing.get(*name) {
            Some(current) if current != value => {
                Some(format!("{}: existing {}, requested {}", name, current, value))
            }
            _ => None,
        })
        .collect();

    if mismatches.is_empty() {
        None
    } else {
        Some(mismatches.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested() -> Vec<(&'static str, String)> {
        vec![
            ("dead_letter_stream", "vpipe:transcode:dlq".to_string()),
            ("max_deliveries", "3".to_string()),
            ("message_ttl_secs", "86400".to_string()),
        ]
    }

    #[test]
    fn test_matching_args_are_compatible() {
        let existing: HashMap<String, String> = requested()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert!(compare_args(&existing, &requested()).is_none());
        assert!(compare_args(&HashMap::new(), &requested()).is_none());
    }

    #[test]
    fn test_mismatch_is_reported() {
        let mut existing = HashMap::new();
        existing.insert("max_deliveries".to_string(), "5".to_string());
        let details = compare_args(&existing, &requested()).unwrap();
        assert_eq!(details, "max_deliveries: existing 5, requested 3");
    }

    #[test]
    fn test_args_key() {
        assert_eq!(args_key("vpipe:transcode"), "vpipe:transcode:args");
        assert!(Topology::DeadLettered.dead_letter_enabled());
        assert!(!Topology::Plain.dead_letter_enabled());
    }
}
