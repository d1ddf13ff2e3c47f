//! Display text of an aggregated notification.

/// Title shown for a notification that has absorbed `count` events.
pub fn render_title(title: &str, count: i32) -> String {
    if count <= 1 {
        title.to_string()
    } else {
        format!("{} ({} messages)", title, count)
    }
}

/// Body shown for a notification that has absorbed `count` events.
pub fn render_message(last_message: &str, count: i32) -> String {
    if count <= 1 {
        last_message.to_string()
    } else {
        format!("Latest: {}", last_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event_is_shown_verbatim() {
        assert_eq!(render_title("New message", 1), "New message");
        assert_eq!(render_message("hi", 1), "hi");
    }

    #[test]
    fn test_aggregated_text() {
        assert_eq!(render_title("New message", 3), "New message (3 messages)");
        assert_eq!(render_message("m3", 3), "Latest: m3");
    }
}
