//! Topic filter matching and validation.

/// Returns true if the topic filter `filter` matches the topic name `topic`.
///
/// Levels are compared pairwise after splitting on `/`. `+` matches exactly
/// one level, a trailing `#` matches every remaining level. A filter with
/// more levels than the topic never matches, so `a/#` does not match `a`.
/// Matching is case-sensitive and an empty level (as produced by a leading
/// slash) is an ordinary level.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/').peekable();
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (Some("#"), Some(_)) if filter_levels.peek().is_none() => return true,
            (Some(f), Some(t)) if f == "+" || f == t => continue,
            _ => return false,
        }
    }
}

/// A topic name is what a PUBLISH is sent to: non-empty, at most 65535
/// bytes, no wildcards and no NUL.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= u16::MAX as usize
        && !topic.contains(['+', '#', '\0'])
}

/// A topic filter is what a SUBSCRIBE carries. `+` must occupy a whole
/// level and `#` must be the whole last level.
pub fn valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        match level {
            "+" => {}
            "#" if last => {}
            _ if level.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}
