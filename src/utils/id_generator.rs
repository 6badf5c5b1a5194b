// src/utils/id_generator.rs
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    User,
    Vehicle,
    Request,
    Trip,
    Notification,
}

impl IdType {
    pub fn to_prefix(&self) -> &'static str {
        match self {
            IdType::User => "usr",
            IdType::Vehicle => "veh",
            IdType::Request => "req",
            IdType::Trip => "trp",
            IdType::Notification => "not",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_prefix())
    }
}

pub struct IdGenerator;

impl IdGenerator {
    /// Generate a unique ID with format: {prefix}-{date}-{random_suffix}
    pub fn generate(id_type: IdType) -> String {
        Self::generate_with_timestamp(id_type, Utc::now())
    }

    /// Generate ID with a specific timestamp (useful for testing)
    pub fn generate_with_timestamp(id_type: IdType, timestamp: DateTime<Utc>) -> String {
        let date_part = timestamp.format("%y%m%d").to_string(); // YYMMDD format
        let random_suffix = Self::generate_random_suffix();

        format!("{}-{}-{}", id_type.to_prefix(), date_part, random_suffix)
    }

    /// Generate the random suffix (5 characters mixing hex and alphanumeric)
    fn generate_random_suffix() -> String {
        if rand::random::<bool>() {
            format!(
                "{}{}",
                Self::generate_hex_chars(3),
                Self::generate_alphanumeric_chars(2)
            )
        } else {
            format!(
                "{}{}",
                Self::generate_alphanumeric_chars(3),
                Self::generate_hex_chars(2)
            )
        }
    }

    fn generate_hex_chars(n: usize) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        Self::generate_from_chars(HEX_CHARS, n)
    }

    fn generate_alphanumeric_chars(n: usize) -> String {
        const ALPHANUMERIC_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        Self::generate_from_chars(ALPHANUMERIC_CHARS, n)
    }

    fn generate_from_chars(charset: &[u8], n: usize) -> String {
        use rand::Rng;

        let mut rng = rand::rng();
        (0..n)
            .map(|_| {
                let idx = rng.random_range(0..charset.len());
                charset[idx] as char
            })
            .collect()
    }

    /// Parse an ID to extract its components
    pub fn parse_id(id: &str) -> Option<ParsedId> {
        let parts: Vec<&str> = id.split('-').collect();
        if parts.len() != 3 {
            return None;
        }

        let prefix = parts[0];
        let date_part = parts[1];
        let random_suffix = parts[2];

        if date_part.len() != 6 || random_suffix.len() != 5 {
            return None;
        }

        let id_type = match prefix {
            "usr" => IdType::User,
            "veh" => IdType::Vehicle,
            "req" => IdType::Request,
            "trp" => IdType::Trip,
            "not" => IdType::Notification,
            _ => return None,
        };

        let year = format!("20{}", &date_part[0..2]).parse::<i32>().ok()?;
        let month = date_part[2..4].parse::<u32>().ok()?;
        let day = date_part[4..6].parse::<u32>().ok()?;

        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return None;
        }

        Some(ParsedId {
            id_type,
            year,
            month,
            day,
            random_suffix: random_suffix.to_string(),
        })
    }

    /// Validate if an ID matches the expected format and type
    pub fn validate_id(id: &str, expected_type: Option<IdType>) -> bool {
        match Self::parse_id(id) {
            Some(parsed) => {
                if let Some(expected) = expected_type {
                    parsed.id_type == expected
                } else {
                    true
                }
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedId {
    pub id_type: IdType,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub random_suffix: String,
}

impl ParsedId {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, 0, 0, 0).single()
    }
}

/// Per-trip OTP: four random digits, generated once at assignment. Never a
/// fixed demo code.
pub fn generate_otp() -> String {
    use rand::Rng;

    let mut rng = rand::rng();
    format!("{:04}", rng.random_range(0..10_000u16))
}

// Integration with models that carry generated ids
pub trait WithGeneratedId {
    fn set_generated_id(&mut self, id_type: IdType);

    fn with_generated_id(mut self, id_type: IdType) -> Self
    where
        Self: Sized,
    {
        self.set_generated_id(id_type);
        self
    }
}

impl WithGeneratedId for crate::models::user::User {
    fn set_generated_id(&mut self, id_type: IdType) {
        self.id = IdGenerator::generate(id_type);
    }
}

impl WithGeneratedId for crate::models::vehicle::Vehicle {
    fn set_generated_id(&mut self, id_type: IdType) {
        self.id = IdGenerator::generate(id_type);
    }
}

impl WithGeneratedId for crate::models::ride::RideRequest {
    fn set_generated_id(&mut self, id_type: IdType) {
        self.id = IdGenerator::generate(id_type);
    }
}

impl WithGeneratedId for crate::models::trip::Trip {
    fn set_generated_id(&mut self, id_type: IdType) {
        self.id = IdGenerator::generate(id_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let user_id = IdGenerator::generate(IdType::User);
        assert!(user_id.starts_with("usr-"));
        assert_eq!(user_id.split('-').count(), 3);

        let trip_id = IdGenerator::generate(IdType::Trip);
        assert!(trip_id.starts_with("trp-"));
    }

    #[test]
    fn test_id_parsing() {
        let test_date = Utc.with_ymd_and_hms(2025, 8, 30, 0, 0, 0).unwrap();
        let id = IdGenerator::generate_with_timestamp(IdType::Vehicle, test_date);

        let parsed = IdGenerator::parse_id(&id).unwrap();
        assert_eq!(parsed.id_type, IdType::Vehicle);
        assert_eq!(parsed.year, 2025);
        assert_eq!(parsed.month, 8);
        assert_eq!(parsed.day, 30);
        assert_eq!(parsed.random_suffix.len(), 5);
    }

    #[test]
    fn test_validation() {
        let valid_id = "req-250830-a1b2c";
        assert!(IdGenerator::validate_id(valid_id, Some(IdType::Request)));
        assert!(!IdGenerator::validate_id(valid_id, Some(IdType::Trip)));

        let invalid_id = "invalid-format";
        assert!(!IdGenerator::validate_id(invalid_id, None));
    }

    #[test]
    fn test_otp_shape() {
        for _ in 0..200 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 4);
            assert!(otp.chars().all(|c| c.is_ascii_digit()), "bad otp: {}", otp);
        }
    }

    #[test]
    fn test_otp_varies() {
        let otps: std::collections::HashSet<String> = (0..50).map(|_| generate_otp()).collect();
        // 50 draws from 10,000 values collide sometimes, but never all of them
        assert!(otps.len() > 1);
    }
}
