/// E.164 normalization for WhatsApp addresses.
///
/// Strips the `@s.whatsapp.net` / `@c.us` suffix, drops whitespace and
/// hyphens, and prefixes `+` if absent. Idempotent: normalizing an already
/// normalized number is a no-op.
pub fn normalize_phone(raw: &str) -> String {
    let bare = raw
        .split_once('@')
        .map(|(id, _)| id)
        .unwrap_or(raw);

    let digits: String = bare
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    if let Some(rest) = digits.strip_prefix('+') {
        format!("+{}", rest)
    } else {
        format!("+{}", digits)
    }
}

/// Contact JID for a bare number: `<digits>@s.whatsapp.net`. Group JIDs
/// (`@g.us`) and already-qualified contact JIDs pass through unchanged.
pub fn to_jid(number_or_jid: &str) -> String {
    if number_or_jid.contains('@') {
        return number_or_jid.to_string();
    }
    let digits: String = number_or_jid
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    format!("{}@s.whatsapp.net", digits)
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_jid_suffix() {
        assert_eq!(normalize_phone("5551234567@s.whatsapp.net"), "+5551234567");
        assert_eq!(normalize_phone("5551234567@c.us"), "+5551234567");
    }

    #[test]
    fn test_normalize_strips_separators_and_prefixes_plus() {
        assert_eq!(normalize_phone("555 123-4567"), "+5551234567");
        assert_eq!(normalize_phone("+555 123 4567"), "+5551234567");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in ["5551234567@s.whatsapp.net", "555-123 4567", "+15551234567", ""] {
            let once = normalize_phone(input);
            assert_eq!(normalize_phone(&once), once);
        }
    }

    #[test]
    fn test_to_jid() {
        assert_eq!(to_jid("5551234567"), "5551234567@s.whatsapp.net");
        assert_eq!(to_jid("+555-123-4567"), "5551234567@s.whatsapp.net");
        assert_eq!(to_jid("abc123@g.us"), "abc123@g.us");
        assert_eq!(
            to_jid("5551234567@s.whatsapp.net"),
            "5551234567@s.whatsapp.net"
        );
    }

    #[test]
    fn test_is_group_jid() {
        assert!(is_group_jid("12345-67890@g.us"));
        assert!(!is_group_jid("5551234567@s.whatsapp.net"));
    }
}
