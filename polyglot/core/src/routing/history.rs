//! History Re-Attribution
//!
//! A merged answer stored in the conversation history contains every bot's
//! section. Before the history goes back to one bot, each merged answer is
//! cut down to that bot's own section so it never reads another bot's text
//! as its own prior reply.

use crate::messages::{MessageRole, ProtocolMessage, QueryRequest};
use crate::streaming::Label;

/// Reduce a bot message to the section written by `label`'s bot
///
/// Messages from other roles, and bot messages without a matching section,
/// are returned unchanged.
#[must_use]
pub fn reattribute_message(message: &ProtocolMessage, label: &Label) -> ProtocolMessage {
    if message.role != MessageRole::Bot {
        return message.clone();
    }

    Label::sections(&message.content)
        .into_iter()
        .find(|section| label.matches(section.name))
        .map_or_else(
            || message.clone(),
            |section| ProtocolMessage::new(MessageRole::Bot, section.text),
        )
}

/// Copy of `request` with every message re-attributed to `label`'s bot
#[must_use]
pub fn reattribute_request(request: &QueryRequest, label: &Label) -> QueryRequest {
    request.with_query(
        request
            .query
            .iter()
            .map(|m| reattribute_message(m, label))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MERGED: &str = "**GPT-4** says:\nUse a cast iron pan.\n\n\
                          **leocooks** says:\nSear it for two minutes.\n\n\
                          **fw-mistral-7b** ran into an error";

    #[test]
    fn test_keeps_only_own_section() {
        let message = ProtocolMessage::bot(MERGED);

        assert_eq!(
            reattribute_message(&message, &Label::new("leocooks")).content,
            "Sear it for two minutes."
        );
        assert_eq!(
            reattribute_message(&message, &Label::new("GPT-4")).content,
            "Use a cast iron pan."
        );
    }

    #[test]
    fn test_case_insensitive_match() {
        let message = ProtocolMessage::bot(MERGED);
        assert_eq!(
            reattribute_message(&message, &Label::new("LeoCooks")).content,
            "Sear it for two minutes."
        );
    }

    #[test]
    fn test_falls_back_to_original() {
        // The failed bot's marker is not a section header
        let message = ProtocolMessage::bot(MERGED);
        assert_eq!(reattribute_message(&message, &Label::new("fw-mistral-7b")), message);

        let plain = ProtocolMessage::bot("Single-bot answer");
        assert_eq!(reattribute_message(&plain, &Label::new("GPT-4")), plain);
    }

    #[test]
    fn test_user_messages_untouched() {
        let message = ProtocolMessage::user("**GPT-4** says:\nquoted by the user");
        assert_eq!(reattribute_message(&message, &Label::new("GPT-4")), message);
    }

    #[test]
    fn test_reattribute_request() {
        let request = QueryRequest::new(
            vec![
                ProtocolMessage::user("How do I cook steak?"),
                ProtocolMessage::bot(MERGED),
                ProtocolMessage::user("And then?"),
            ],
            "key",
        );

        let rewritten = reattribute_request(&request, &Label::new("GPT-4"));
        assert_eq!(rewritten.conversation_id, request.conversation_id);
        assert_eq!(rewritten.query[0], request.query[0]);
        assert_eq!(rewritten.query[1].content, "Use a cast iron pan.");
        assert_eq!(rewritten.query[2], request.query[2]);
    }
}
