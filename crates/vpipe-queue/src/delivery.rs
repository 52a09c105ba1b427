//! Stream deliveries and their expiry rules.

use std::time::Duration;

use vpipe_models::TranscodeJob;

/// Stream entry field holding the job payload.
pub const JOB_FIELD: &str = "job";

/// One message handed to this consumer and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream entry ID (`<ms>-<seq>`)
    pub message_id: String,
    /// Raw `job` field, if the entry carried one
    pub payload: Option<String>,
    /// Times this entry has been delivered, including this one
    pub deliveries: u32,
}

impl Delivery {
    pub fn new(message_id: impl Into<String>, payload: Option<String>, deliveries: u32) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
            deliveries,
        }
    }

    /// Parse and validate the job payload.
    pub fn parse(&self) -> Result<TranscodeJob, String> {
        let payload = self
            .payload
            .as_deref()
            .ok_or_else(|| format!("entry has no '{}' field", JOB_FIELD))?;
        TranscodeJob::from_payload(payload)
    }

    /// Enqueue time from the entry ID.
    pub fn timestamp_ms(&self) -> Option<u64> {
        message_timestamp_ms(&self.message_id)
    }

    /// Reason this delivery must be dead-lettered instead of processed.
    pub fn expiry_reason(&self, max_deliveries: u32, ttl: Duration, now_ms: u64) -> Option<String> {
        if self.deliveries > max_deliveries {
            return Some(format!(
                "delivery limit reached ({} deliveries, max {})",
                self.deliveries, max_deliveries
            ));
        }
        let enqueued = self.timestamp_ms()?;
        let age_ms = now_ms.saturating_sub(enqueued);
        if age_ms > ttl.as_millis() as u64 {
            return Some(format!("message expired after {}s", age_ms / 1000));
        }
        None
    }
}

/// Millisecond timestamp part of a stream entry ID.
pub fn message_timestamp_ms(message_id: &str) -> Option<u64> {
    message_id.split('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn test_message_timestamp() {
        assert_eq!(message_timestamp_ms("1700000000000-0"), Some(1_700_000_000_000));
        assert_eq!(message_timestamp_ms("1700000000000-12"), Some(1_700_000_000_000));
        assert_eq!(message_timestamp_ms("garbage"), None);
    }

    #[test]
    fn test_parse_valid_payload() {
        let delivery = Delivery::new(
            "1-0",
            Some(r#"{"videoId":"v1","filePath":"uploads/v1.mp4","fileName":"v1.mp4"}"#.to_string()),
            1,
        );
        let job = delivery.parse().unwrap();
        assert_eq!(job.video_id.as_str(), "v1");
    }

    #[test]
    fn test_parse_missing_field() {
        let delivery = Delivery::new("1-0", None, 1);
        assert!(delivery.parse().unwrap_err().contains("job"));

        let delivery = Delivery::new("1-0", Some(r#"{"videoId":""}"#.to_string()), 1);
        assert!(delivery.parse().is_err());
    }

    #[test]
    fn test_delivery_limit() {
        let now = 1_700_000_000_000;
        let fresh = Delivery::new(format!("{}-0", now), None, 3);
        assert!(fresh.expiry_reason(3, TTL, now).is_none());

        let exhausted = Delivery::new(format!("{}-0", now), None, 4);
        let reason = exhausted.expiry_reason(3, TTL, now).unwrap();
        assert!(reason.contains("delivery limit"));
    }

    #[test]
    fn test_message_ttl() {
        let enqueued = 1_700_000_000_000u64;
        let delivery = Delivery::new(format!("{}-0", enqueued), None, 1);

        let within = enqueued + TTL.as_millis() as u64;
        assert!(delivery.expiry_reason(3, TTL, within).is_none());

        let past = within + 1000;
        assert!(delivery.expiry_reason(3, TTL, past).unwrap().contains("expired"));
    }
}
