use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const COUNTRY_CODE: &str = "55";
pub const DIRECT_CHAT_SUFFIX: &str = "@c.us";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneError {
    #[error("phone number has no digits")]
    Empty,
    #[error("phone number has {digits} digits after normalization, expected 12 or 13")]
    InvalidLength { digits: usize },
}

impl PhoneError {
    pub fn code(&self) -> &'static str {
        "INVALID_PHONE_NUMBER"
    }
}

/// Canonical direct-chat recipient: country-prefixed digits plus the chat suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecipientAddress(String);

impl RecipientAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn digits(&self) -> &str {
        self.0.trim_end_matches(DIRECT_CHAT_SUFFIX)
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RecipientAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// Map a free-form phone string to a recipient address.
///
/// Every non-digit is stripped. Ten or eleven digits are a local number and
/// get the country code prepended; the result must then be 12 or 13 digits.
pub fn normalize(raw: &str) -> Result<RecipientAddress, PhoneError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(PhoneError::Empty);
    }
    let with_country = match digits.len() {
        10 | 11 => format!("{COUNTRY_CODE}{digits}"),
        _ => digits,
    };
    if !matches!(with_country.len(), 12 | 13) {
        return Err(PhoneError::InvalidLength {
            digits: with_country.len(),
        });
    }
    Ok(RecipientAddress(format!("{with_country}{DIRECT_CHAT_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mobile_gets_country_code() {
        let address = normalize("11987654321").expect("valid");
        assert_eq!(address.as_str(), "5511987654321@c.us");
        assert_eq!(address.digits().len(), 13);
    }

    #[test]
    fn formatting_characters_are_stripped() {
        let address = normalize("+55 (11) 98765-4321").expect("valid");
        assert_eq!(address.as_str(), "5511987654321@c.us");
        let landline = normalize("(11) 3456-7890").expect("valid");
        assert_eq!(landline.as_str(), "551134567890@c.us");
    }

    #[test]
    fn already_prefixed_numbers_pass_through() {
        assert_eq!(
            normalize("551134567890").expect("12 digits").digits(),
            "551134567890"
        );
        assert_eq!(
            normalize("5511987654321").expect("13 digits").digits(),
            "5511987654321"
        );
    }

    #[test]
    fn other_lengths_are_rejected() {
        assert_eq!(normalize("123"), Err(PhoneError::InvalidLength { digits: 3 }));
        assert_eq!(normalize(""), Err(PhoneError::Empty));
        assert_eq!(normalize("abc-def"), Err(PhoneError::Empty));
        for len in [1usize, 5, 9, 14, 20] {
            let raw = "9".repeat(len);
            assert!(normalize(&raw).is_err(), "length {len} should be rejected");
        }
    }

    #[test]
    fn accepted_addresses_always_have_12_or_13_digits() {
        for len in 1usize..=20 {
            let raw = "7".repeat(len);
            if let Ok(address) = normalize(&raw) {
                assert!(matches!(len, 10 | 11 | 12 | 13));
                assert!(matches!(address.digits().len(), 12 | 13));
            } else {
                assert!(!matches!(len, 10 | 11 | 12 | 13));
            }
        }
    }
}
