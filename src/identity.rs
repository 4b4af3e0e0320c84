//! Canonicalization of principal identifiers across transports.
//!
//! An "owner token" is the single identity key the rest of the system keys
//! state on: a 10-digit US phone string, a `telegram:<id>` string, or the
//! literal `default` for unparseable/self-chat-system principals.

/// Owner token used for the system/self-chat context when no principal
/// can be resolved.
pub const DEFAULT_OWNER: &str = "default";

/// Canonicalize an arbitrary principal string into an owner token.
///
/// - Strings beginning with `telegram:` pass through unchanged.
/// - Digits are extracted; an 11-digit string starting with `1` is reduced
///   to the trailing 10 digits.
/// - Anything that doesn't resolve to a 10-digit US number becomes
///   [`DEFAULT_OWNER`].
///
/// Idempotent: `canonicalize(canonicalize(x)) == canonicalize(x)`.
pub fn canonicalize(principal: &str) -> String {
    if principal.starts_with("telegram:") {
        return principal.to_owned();
    }

    let digits: String = principal.chars().filter(char::is_ascii_digit).collect();

    let ten = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_owned()
    } else {
        digits
    };

    if ten.len() == 10 {
        ten
    } else {
        DEFAULT_OWNER.to_owned()
    }
}

/// Render a canonical 10-digit phone id in E.164 form (`+1##########`).
///
/// Returns `None` if `canonical` is not a 10-digit string.
pub fn to_e164(canonical: &str) -> Option<String> {
    if canonical.len() == 10 && canonical.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("+1{canonical}"))
    } else {
        None
    }
}

/// Render a canonical 10-digit phone id in 11-digit form (`1##########`).
///
/// Returns `None` if `canonical` is not a 10-digit string.
pub fn to_eleven_digit(canonical: &str) -> Option<String> {
    if canonical.len() == 10 && canonical.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("1{canonical}"))
    } else {
        None
    }
}

/// Build a Telegram owner token from a numeric Telegram user id.
pub fn telegram_owner(telegram_id: i64) -> String {
    format!("telegram:{telegram_id}")
}
