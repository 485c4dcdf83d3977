//! Recipient identity (JID) utilities.
//!
//! Recipients are addressed by JIDs of the form `{number}@{domain}`, with a
//! separate domain for group chats. Phone numbers are validated and
//! normalized before formatting.

use lazy_static::lazy_static;
use regex::Regex;

/// Domain suffix for direct-message JIDs.
pub const USER_DOMAIN: &str = "s.waveline.example";

/// Domain suffix for group JIDs.
pub const GROUP_DOMAIN: &str = "g.us";

lazy_static! {
    static ref PHONE_RE: Regex = Regex::new(r"^\d{10,15}$").unwrap();
    static ref NON_DIGIT_RE: Regex = Regex::new(r"\D").unwrap();
}

/// Validate a phone number: 10-15 digits, optional leading `+`.
pub fn validate_phone_number(phone: &str) -> bool {
    let cleaned = phone.trim().replace('+', "");
    PHONE_RE.is_match(&cleaned)
}

/// Normalize a phone number by stripping non-digits and defaulting the
/// country code to 1 when absent.
pub fn normalize_phone_number(phone: &str) -> String {
    let digits = NON_DIGIT_RE.replace_all(phone, "").into_owned();
    if digits.len() <= 10 {
        format!("1{digits}")
    } else {
        digits
    }
}

/// Format a phone number into a JID.
pub fn format_jid(phone: &str, is_group: bool) -> String {
    let number = normalize_phone_number(phone);
    let domain = if is_group { GROUP_DOMAIN } else { USER_DOMAIN };
    format!("{number}@{domain}")
}

/// Extract the phone number portion of a JID.
pub fn extract_phone_from_jid(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Whether a JID addresses a group chat.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_DOMAIN)
}

/// Resolve a caller-supplied recipient into a JID, formatting bare phone
/// numbers and passing through anything already containing a domain.
pub fn resolve_recipient(recipient: &str) -> String {
    if recipient.contains('@') {
        recipient.to_string()
    } else {
        format_jid(recipient, false)
    }
}
