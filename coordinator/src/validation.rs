use crate::amount::Amount;
use crate::errors::{WalletError, WalletResult};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;

/// Largest amount accepted for a single top-up, transfer or QR request.
pub const MAX_AMOUNT: u64 = 1_000_000_000;
/// Upper bound on a decoded QR string.
pub const MAX_SCAN_LENGTH: usize = 2048;

static MALICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"<script",
        r"javascript:",
        r"data:text/html",
        r"vbscript:",
        r"onload=",
        r"onerror=",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Client-side input validation, applied before any network round trip.
#[derive(Debug)]
pub struct InputValidator {
    email_pattern: Regex,
    phone_pattern: Regex,
    name_pattern: Regex,
}

impl InputValidator {
    pub fn new() -> WalletResult<Self> {
        let email_pattern = Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
            .map_err(|e| WalletError::ValidationError(format!("Invalid email regex: {}", e)))?;

        let phone_pattern = Regex::new(r"^\+?[0-9]{7,15}$")
            .map_err(|e| WalletError::ValidationError(format!("Invalid phone regex: {}", e)))?;

        let name_pattern = Regex::new(r"^[\p{L}\p{M}0-9 .'\-]+$")
            .map_err(|e| WalletError::ValidationError(format!("Invalid name regex: {}", e)))?;

        Ok(InputValidator {
            email_pattern,
            phone_pattern,
            name_pattern,
        })
    }

    pub fn validate_email(&self, email: &str) -> WalletResult<()> {
        self.check_basic_security(email)?;

        if email.trim().is_empty() {
            return Err(WalletError::ValidationError(
                "Email cannot be empty".to_string(),
            ));
        }

        if email.len() > 254 || !self.email_pattern.is_match(email.trim()) {
            return Err(WalletError::ValidationError(
                "Email format is invalid".to_string(),
            ));
        }

        Ok(())
    }

    /// Passwords entered to log in or to authorize a transfer.
    pub fn validate_password_entry(&self, password: &SecretString) -> WalletResult<()> {
        let password = password.expose_secret();
        if password.is_empty() {
            return Err(WalletError::ValidationError(
                "Password cannot be empty".to_string(),
            ));
        }
        if password.len() > 256 {
            return Err(WalletError::ValidationError(
                "Password too long".to_string(),
            ));
        }
        Ok(())
    }

    /// Passwords chosen at registration.
    pub fn validate_new_password(&self, password: &SecretString) -> WalletResult<()> {
        self.validate_password_entry(password)?;
        let password = password.expose_secret();

        if password.chars().count() < 6 {
            return Err(WalletError::ValidationError(
                "Password must be at least 6 characters".to_string(),
            ));
        }

        if self.is_common_password(password) {
            return Err(WalletError::ValidationError(
                "Password is too common, please choose a stronger password".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_name(&self, name: &str) -> WalletResult<()> {
        self.check_basic_security(name)?;

        let name = name.trim();
        if name.is_empty() {
            return Err(WalletError::ValidationError(
                "Name cannot be empty".to_string(),
            ));
        }

        if name.chars().count() > 80 {
            return Err(WalletError::ValidationError("Name too long".to_string()));
        }

        if !self.name_pattern.is_match(name) {
            return Err(WalletError::ValidationError(
                "Name contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Phone numbers may be written with spaces or dashes between digit groups.
    pub fn validate_phone(&self, phone: &str) -> WalletResult<()> {
        let compact: String = phone
            .chars()
            .filter(|c| !matches!(c, ' ' | '-'))
            .collect();
        if !self.phone_pattern.is_match(&compact) {
            return Err(WalletError::ValidationError(
                "Phone number must contain 7 to 15 digits".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_amount(&self, amount: Amount) -> WalletResult<()> {
        if !amount.is_positive() {
            return Err(WalletError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }

        if amount.value() > Decimal::from(MAX_AMOUNT) {
            return Err(WalletError::ValidationError("Amount too large".to_string()));
        }

        if amount.value().normalize().scale() > 2 {
            return Err(WalletError::ValidationError(
                "Amount supports at most two decimal places".to_string(),
            ));
        }

        Ok(())
    }

    /// Basic hygiene for a decoded QR string; returns the trimmed value.
    pub fn validate_scan<'a>(&self, raw: &'a str) -> WalletResult<&'a str> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(WalletError::ValidationError(
                "Scanned code is empty".to_string(),
            ));
        }

        if trimmed.len() > MAX_SCAN_LENGTH {
            return Err(WalletError::ValidationError(
                "Scanned code is too long".to_string(),
            ));
        }

        if trimmed.chars().any(|c| c.is_control()) {
            return Err(WalletError::ValidationError(
                "Scanned code contains unreadable characters".to_string(),
            ));
        }

        self.check_basic_security(trimmed)?;
        Ok(trimmed)
    }

    /// Check for basic security issues in any input
    fn check_basic_security(&self, input: &str) -> WalletResult<()> {
        if input.len() > MAX_SCAN_LENGTH {
            return Err(WalletError::ValidationError("Input too long".to_string()));
        }

        let lowered = input.to_lowercase();
        if MALICIOUS_PATTERNS
            .iter()
            .any(|pattern| pattern.is_match(&lowered))
        {
            return Err(WalletError::ValidationError(
                "Input contains potentially malicious content".to_string(),
            ));
        }

        Ok(())
    }

    fn is_common_password(&self, password: &str) -> bool {
        let common_passwords: HashSet<&str> = [
            "password",
            "password1",
            "password123",
            "123456",
            "1234567",
            "12345678",
            "123456789",
            "qwerty",
            "qwerty123",
            "abc123",
            "111111",
            "welcome123",
        ]
        .iter()
        .cloned()
        .collect();

        common_passwords.contains(password.to_lowercase().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InputValidator {
        InputValidator::new().unwrap()
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn test_email_validation() {
        let v = validator();
        assert!(v.validate_email("asha@example.com").is_ok());
        assert!(v.validate_email("first.last+pay@bank.co.in").is_ok());
        assert!(v.validate_email("").is_err());
        assert!(v.validate_email("no-at-sign.com").is_err());
        assert!(v.validate_email("a@b").is_err());
    }

    #[test]
    fn test_amount_validation() {
        let v = validator();
        assert!(v.validate_amount(Amount::from(500u64)).is_ok());
        assert!(v.validate_amount("0.50".parse().unwrap()).is_ok());
        assert!(v.validate_amount(Amount::ZERO).is_err());
        assert!(v.validate_amount("-3".parse().unwrap()).is_err());
        assert!(v.validate_amount("0.001".parse().unwrap()).is_err());
        assert!(v.validate_amount(Amount::from(MAX_AMOUNT + 1)).is_err());
    }

    #[test]
    fn test_password_rules() {
        let v = validator();
        assert!(v.validate_password_entry(&secret("x")).is_ok());
        assert!(v.validate_password_entry(&secret("")).is_err());
        assert!(v.validate_new_password(&secret("s3cure-pass")).is_ok());
        assert!(v.validate_new_password(&secret("abc")).is_err());
        assert!(v.validate_new_password(&secret("Password123")).is_err());
    }

    #[test]
    fn test_phone_and_name() {
        let v = validator();
        assert!(v.validate_phone("+91 98765-43210").is_ok());
        assert!(v.validate_phone("12345").is_err());
        assert!(v.validate_name("Asha Rao").is_ok());
        assert!(v.validate_name("   ").is_err());
        assert!(v.validate_name("<script>alert(1)</script>").is_err());
    }

    #[test]
    fn test_scan_hygiene() {
        let v = validator();
        assert_eq!(v.validate_scan("  qr-42 \n").unwrap(), "qr-42");
        assert!(v.validate_scan("   ").is_err());
        assert!(v.validate_scan("qr\u{0007}42").is_err());
        assert!(v.validate_scan("javascript:alert(1)").is_err());
        assert!(v.validate_scan(&"x".repeat(MAX_SCAN_LENGTH + 1)).is_err());
    }
}
