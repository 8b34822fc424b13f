use uuid::Uuid;

use crate::error::ProxyError;
use crate::wire::ChatMessage;

/// Stamps an 8-character request id, matching the original's
/// `str(uuid.uuid4())[:8]` used in logs and the `X-Request-ID` header.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string().chars().take(8).collect()
}

/// Streaming is used iff the global flag is on AND the client's Accept
/// header contains `text/event-stream`.
pub fn wants_streaming(globally_enabled: bool, accept_header: Option<&str>) -> bool {
    globally_enabled
        && accept_header
            .map(|h| h.contains("text/event-stream"))
            .unwrap_or(false)
}

/// Pulls the text out of the first user-role message, matching the original's
/// tolerant handling of string vs. `{text: ...}` content.
pub fn extract_user_text(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_text().to_string())
}

/// Splits `model` on `-`: three-or-more parts gives `(source, target)`,
/// exactly two parts gives `(auto-detect, target)`, fewer is rejected.
pub fn parse_model(model: &str) -> Result<(String, String), ProxyError> {
    let parts: Vec<&str> = model.split('-').collect();
    match parts.len() {
        0 | 1 => Err(ProxyError::InvalidModelFormat),
        2 => Ok((String::new(), parts[1].to_uppercase())),
        _ => Ok((parts[1].to_uppercase(), parts[2].to_uppercase())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageContent;

    #[test]
    fn request_id_is_eight_chars() {
        assert_eq!(new_request_id().chars().count(), 8);
    }

    #[test]
    fn streaming_requires_both_flag_and_accept_header() {
        assert!(wants_streaming(true, Some("text/event-stream")));
        assert!(!wants_streaming(false, Some("text/event-stream")));
        assert!(!wants_streaming(true, Some("application/json")));
        assert!(!wants_streaming(true, None));
    }

    #[test]
    fn parses_three_part_model() {
        let (source, target) = parse_model("deepl-en-zh").unwrap();
        assert_eq!(source, "EN");
        assert_eq!(target, "ZH");
    }

    #[test]
    fn parses_two_part_model_as_auto_detect() {
        let (source, target) = parse_model("deepl-zh").unwrap();
        assert_eq!(source, "");
        assert_eq!(target, "ZH");
    }

    #[test]
    fn single_part_model_is_rejected() {
        assert!(matches!(
            parse_model("deepl"),
            Err(ProxyError::InvalidModelFormat)
        ));
    }

    #[test]
    fn extracts_text_from_string_content() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Text("hello".to_string()),
        }];
        assert_eq!(extract_user_text(&messages).as_deref(), Some("hello"));
    }

    #[test]
    fn extracts_text_from_object_content() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Object {
                text: "hello".to_string(),
            },
        }];
        assert_eq!(extract_user_text(&messages).as_deref(), Some("hello"));
    }

    #[test]
    fn ignores_non_user_messages() {
        let messages = vec![ChatMessage {
            role: "system".to_string(),
            content: MessageContent::Text("ignored".to_string()),
        }];
        assert!(extract_user_text(&messages).is_none());
    }
}
