//! Input validation used by the queue core before any remote write.
//!
//! Each check returns the normalized value on success so the core stores
//! exactly what it validated.

use crate::error::ValidationError;
use crate::models::{PriceTable, VehicleKind, VehicleSize, VehicleStatus};

const PLATE_MIN_LEN: usize = 2;
const PLATE_MAX_LEN: usize = 12;
const MODEL_MAX_LEN: usize = 100;
const NAME_MAX_LEN: usize = 100;
const CANCEL_REASON_MIN_LEN: usize = 3;
const CANCEL_REASON_MAX_LEN: usize = 500;
const HISTORY_TERM_MIN_LEN: usize = 3;
const HISTORY_TERM_MAX_LEN: usize = 20;

/// Trim, uppercase and collapse inner whitespace runs to one space.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Plates are letters and digits, optionally separated by single spaces or
/// hyphens, and must contain at least one digit.
pub fn validate_plate(plate: &str) -> Result<String, ValidationError> {
    let normalized = normalize_plate(plate);
    if normalized.is_empty() {
        return Err(ValidationError::new("Plate number is required"));
    }
    let len = normalized.chars().count();
    if !(PLATE_MIN_LEN..=PLATE_MAX_LEN).contains(&len) {
        return Err(ValidationError::new(format!(
            "Plate number must be {PLATE_MIN_LEN}-{PLATE_MAX_LEN} characters"
        )));
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ' ')
    {
        return Err(ValidationError::new(
            "Plate number may only contain letters, digits, spaces and hyphens",
        ));
    }
    let is_sep = |c: char| c == '-' || c == ' ';
    if normalized.starts_with(is_sep) || normalized.ends_with(is_sep) {
        return Err(ValidationError::new(
            "Plate number cannot start or end with a separator",
        ));
    }
    if normalized.contains("--") || normalized.contains("- ") || normalized.contains(" -") {
        return Err(ValidationError::new(
            "Plate number cannot contain consecutive separators",
        ));
    }
    if !normalized.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new("Plate number must contain a digit"));
    }
    Ok(normalized)
}

pub fn validate_model(model: &str) -> Result<String, ValidationError> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("Model is required"));
    }
    if trimmed.chars().count() > MODEL_MAX_LEN {
        return Err(ValidationError::new(format!(
            "Model must be at most {MODEL_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Philippine mobile numbers: `09XXXXXXXXX`, `639XXXXXXXXX` or
/// `+639XXXXXXXXX`, with optional spaces, hyphens or parentheses.
/// Normalized to E.164 (`+639XXXXXXXXX`).
pub fn validate_phone(phone: &str) -> Result<String, ValidationError> {
    let trimmed = phone.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let stray = trimmed
        .chars()
        .enumerate()
        .any(|(i, c)| !(c.is_ascii_digit() || " -()".contains(c) || (c == '+' && i == 0)));
    if stray {
        return Err(ValidationError::new("Phone number contains invalid characters"));
    }

    let subscriber = if !has_plus && digits.len() == 11 && digits.starts_with("09") {
        Some(&digits[1..])
    } else if digits.len() == 12 && digits.starts_with("639") {
        Some(&digits[2..])
    } else {
        None
    };

    match subscriber {
        Some(rest) => Ok(format!("+63{rest}")),
        None => Err(ValidationError::new(
            "Phone number must be a valid mobile number (e.g. 09171234567)",
        )),
    }
}

/// Empty or blank phone means "no phone"; anything else must validate.
pub fn validate_optional_phone(phone: Option<&str>) -> Result<Option<String>, ValidationError> {
    match phone.map(str::trim) {
        None | Some("") => Ok(None),
        Some(p) => validate_phone(p).map(Some),
    }
}

pub fn validate_cost(cost: f64) -> Result<f64, ValidationError> {
    if !cost.is_finite() {
        return Err(ValidationError::new("Cost must be a number"));
    }
    if cost < 0.0 {
        return Err(ValidationError::new("Cost cannot be negative"));
    }
    Ok(cost)
}

pub fn validate_size(kind: VehicleKind, size: VehicleSize) -> Result<VehicleSize, ValidationError> {
    if size.is_valid_for(kind) {
        Ok(size)
    } else {
        Err(ValidationError::new(format!(
            "Size {size} is not available for a {kind}"
        )))
    }
}

/// New vehicles enter the queue either waiting or already in progress.
pub fn validate_initial_status(status: VehicleStatus) -> Result<VehicleStatus, ValidationError> {
    match status {
        VehicleStatus::Waiting | VehicleStatus::InProgress => Ok(status),
        other => Err(ValidationError::new(format!(
            "A new vehicle cannot start as {other}"
        ))),
    }
}

pub fn validate_cancellation_reason(reason: &str) -> Result<String, ValidationError> {
    let trimmed = reason.trim();
    let len = trimmed.chars().count();
    if len < CANCEL_REASON_MIN_LEN {
        return Err(ValidationError::new(format!(
            "Cancellation reason must be at least {CANCEL_REASON_MIN_LEN} characters"
        )));
    }
    if len > CANCEL_REASON_MAX_LEN {
        return Err(ValidationError::new(format!(
            "Cancellation reason must be at most {CANCEL_REASON_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_history_term(term: &str) -> Result<String, ValidationError> {
    let trimmed = term.trim();
    let len = trimmed.chars().count();
    if !(HISTORY_TERM_MIN_LEN..=HISTORY_TERM_MAX_LEN).contains(&len) {
        return Err(ValidationError::new(format!(
            "Search term must be {HISTORY_TERM_MIN_LEN}-{HISTORY_TERM_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Names of crew members, services and packages.
pub fn validate_name(label: &str, name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(format!("{label} name is required")));
    }
    if trimmed.chars().count() > NAME_MAX_LEN {
        return Err(ValidationError::new(format!(
            "{label} name must be at most {NAME_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_price_table(
    kind: VehicleKind,
    prices: &PriceTable,
) -> Result<(), ValidationError> {
    for (size, price) in prices {
        validate_size(kind, *size)?;
        validate_cost(*price)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plate_is_normalized() {
        assert_eq!(validate_plate("  abc-1234 ").unwrap(), "ABC-1234");
        assert_eq!(validate_plate("abc   1234").unwrap(), "ABC 1234");
        assert_eq!(validate_plate("123abc").unwrap(), "123ABC");
    }

    #[test]
    fn test_plate_rejects_bad_input() {
        assert!(validate_plate("").is_err());
        assert!(validate_plate("   ").is_err());
        assert!(validate_plate("A").is_err());
        assert!(validate_plate("ABCDEFGHIJ1234").is_err());
        assert!(validate_plate("ABC_1234").is_err());
        assert!(validate_plate("-ABC1234").is_err());
        assert!(validate_plate("ABC--1234").is_err());
        assert!(validate_plate("ABCDEF").is_err());
    }

    #[test]
    fn test_phone_formats() {
        assert_eq!(validate_phone("09171234567").unwrap(), "+639171234567");
        assert_eq!(validate_phone("0917-123-4567").unwrap(), "+639171234567");
        assert_eq!(validate_phone("+63 917 123 4567").unwrap(), "+639171234567");
        assert_eq!(validate_phone("639171234567").unwrap(), "+639171234567");
        assert!(validate_phone("12345").is_err());
        assert!(validate_phone("0917123456a").is_err());
        assert!(validate_phone("+09171234567").is_err());
    }

    #[test]
    fn test_optional_phone_blank_is_none() {
        assert_eq!(validate_optional_phone(None).unwrap(), None);
        assert_eq!(validate_optional_phone(Some("  ")).unwrap(), None);
        assert!(validate_optional_phone(Some("bad")).is_err());
    }

    #[test]
    fn test_cost_must_be_non_negative() {
        assert_eq!(validate_cost(0.0).unwrap(), 0.0);
        assert_eq!(validate_cost(200.0).unwrap(), 200.0);
        assert!(validate_cost(-1.0).is_err());
        assert!(validate_cost(f64::NAN).is_err());
    }

    #[test]
    fn test_initial_status() {
        assert!(validate_initial_status(VehicleStatus::Waiting).is_ok());
        assert!(validate_initial_status(VehicleStatus::InProgress).is_ok());
        assert!(validate_initial_status(VehicleStatus::Completed).is_err());
    }

    #[test]
    fn test_cancellation_reason_bounds() {
        assert!(validate_cancellation_reason("  no ").is_err());
        assert_eq!(
            validate_cancellation_reason(" left early ").unwrap(),
            "left early"
        );
        assert!(validate_cancellation_reason(&"x".repeat(501)).is_err());
        assert!(validate_cancellation_reason(&"x".repeat(500)).is_ok());
    }

    #[test]
    fn test_history_term_bounds() {
        assert!(validate_history_term(" ab ").is_err());
        assert_eq!(validate_history_term(" abc ").unwrap(), "abc");
        assert!(validate_history_term(&"a".repeat(21)).is_err());
    }

    #[test]
    fn test_size_for_motorcycle() {
        assert!(validate_size(VehicleKind::Motorcycle, VehicleSize::Large).is_ok());
        assert!(validate_size(VehicleKind::Motorcycle, VehicleSize::ExtraLarge).is_err());
    }

    #[test]
    fn test_price_table_rejects_negative_and_foreign_sizes() {
        let mut prices = PriceTable::new();
        prices.insert(VehicleSize::Small, 100.0);
        assert!(validate_price_table(VehicleKind::Motorcycle, &prices).is_ok());
        prices.insert(VehicleSize::ExtraLarge, 300.0);
        assert!(validate_price_table(VehicleKind::Motorcycle, &prices).is_err());
        assert!(validate_price_table(VehicleKind::Car, &prices).is_ok());
        prices.insert(VehicleSize::Medium, -5.0);
        assert!(validate_price_table(VehicleKind::Car, &prices).is_err());
    }
}
