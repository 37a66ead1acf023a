use crate::error::ValidationError;
use chrono::{DateTime, Utc};

/// One decoded inbound message. Never persisted as-is, only written to the raw backup log.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub topic: String,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

/// Sensors publish a bare decimal: optional sign, digits, optional fraction. Exponents,
/// `nan` and `inf` are rejected even though `f64::from_str` would take them.
pub fn parse_reading_payload(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<RawObservation, ValidationError> {
    let text = std::str::from_utf8(payload).map_err(|_| ValidationError::NotUtf8 {
        topic: topic.to_string(),
    })?;
    let trimmed = text.trim();
    let not_numeric = || ValidationError::NotNumeric {
        topic: topic.to_string(),
        payload: trimmed.to_string(),
    };

    if !is_decimal(trimmed) {
        return Err(not_numeric());
    }
    let value = trimmed.parse::<f64>().map_err(|_| not_numeric())?;
    if !value.is_finite() {
        return Err(not_numeric());
    }

    Ok(RawObservation {
        topic: topic.to_string(),
        value,
        received_at,
    })
}

fn is_decimal(text: &str) -> bool {
    let unsigned = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (unsigned, ""),
    };
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    !(whole.is_empty() && fraction.is_empty()) && digits(whole) && digits(fraction)
}
