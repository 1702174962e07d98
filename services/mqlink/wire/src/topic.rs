//! Topic name and topic filter grammar.

use crate::WireError;

/// Longest topic accepted on the wire
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name used for PUBLISH
pub fn validate_topic_name(topic: &str) -> Result<(), WireError> {
    if topic.is_empty() {
        return Err(WireError::Topic("topic name is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(WireError::Topic("topic name is too long"));
    }
    if topic.contains('\0') {
        return Err(WireError::Topic("topic name contains a null character"));
    }
    if topic.contains(['+', '#']) {
        return Err(WireError::Topic("topic name contains a wildcard"));
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE and UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> Result<(), WireError> {
    if filter.is_empty() {
        return Err(WireError::Topic("topic filter is empty"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(WireError::Topic("topic filter is too long"));
    }
    if filter.contains('\0') {
        return Err(WireError::Topic("topic filter contains a null character"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(WireError::Topic("'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(WireError::Topic("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Check whether a topic name matches a topic filter.
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_rules() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
    }

    #[test]
    fn test_topic_filter_rules() {
        for ok in ["#", "+", "a/+/c", "a/b/#", "+/+", "/"] {
            assert!(validate_topic_filter(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "a/#/c", "a#", "a/b+", "#/"] {
            assert!(validate_topic_filter(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_matching() {
        assert!(topic_matches("sport/#", "sport"));
        assert!(topic_matches("sport/#", "sport/tennis/player1"));
        assert!(topic_matches("sport/+/player1", "sport/tennis/player1"));
        assert!(topic_matches("+/+", "/finance"));
        assert!(!topic_matches("sport/+", "sport/tennis/player1"));
        assert!(!topic_matches("sport/tennis", "sport"));
        assert!(topic_matches("a/b", "a/b"));
    }

    #[test]
    fn test_dollar_topics_skip_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
