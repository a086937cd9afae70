//! Topic name and filter checks applied before anything is queued.

use crate::error::{Error, Result};

fn invalid(topic: &str, why: &str) -> Error {
    Error::InvalidTopic(format!("{topic:?}: {why}"))
}

fn check_common(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(invalid(topic, "empty"));
    }
    if topic.len() > u16::MAX as usize {
        return Err(invalid(topic, "longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(invalid(topic, "contains NUL"));
    }
    Ok(())
}

/// Validate a topic name used in PUBLISH: no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(invalid(topic, "wildcards are not allowed in topic names"));
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE/UNSUBSCRIBE.
///
/// `+` must fill a whole level; `#` must fill the last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    check_common(filter)?;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => return Err(invalid(filter, "# must be the last level")),
            "#" | "+" => {}
            _ if level.contains(['+', '#']) => {
                return Err(invalid(filter, "wildcards must fill a whole level"));
            }
            _ => {}
        }
    }
    Ok(())
}
