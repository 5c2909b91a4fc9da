//! Markers the platform sends while running its release test.

use crate::message::DecodedMessage;

const RELEASE_TEST_TEXT: &str = "TESTCOMPONENT_MSG_TYPE_TEXT";
const QUERY_AUTH_CODE_PREFIX: &str = "QUERY_AUTH_CODE:";

/// Reply expected for [`TestCommand::ReleaseTestText`].
pub const RELEASE_TEST_REPLY: &str = "TESTCOMPONENT_MSG_TYPE_TEXT_callback";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCommand<'a> {
    /// Must be answered synchronously with [`RELEASE_TEST_REPLY`]
    ReleaseTestText,
    /// Must be acknowledged with an empty body, then handled out of band
    QueryAuthCode(&'a str),
}

impl<'a> TestCommand<'a> {
    /// Recognizes release-test text messages. Anything else is `None`.
    pub fn parse(message: &'a DecodedMessage) -> Option<Self> {
        if message.msg_type() != Some("text") {
            return None;
        }

        let content = message.content()?;
        if content == RELEASE_TEST_TEXT {
            return Some(Self::ReleaseTestText);
        }
        content
            .strip_prefix(QUERY_AUTH_CODE_PREFIX)
            .map(Self::QueryAuthCode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> DecodedMessage {
        DecodedMessage::parse(&format!(
            "<xml><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[{}]]></Content></xml>",
            content
        ))
        .unwrap()
    }

    #[test]
    fn test_release_test_text() {
        let msg = text("TESTCOMPONENT_MSG_TYPE_TEXT");
        assert_eq!(TestCommand::parse(&msg), Some(TestCommand::ReleaseTestText));
    }

    #[test]
    fn test_query_auth_code() {
        let msg = text("QUERY_AUTH_CODE:queryauthcode@@@abc");
        assert_eq!(
            TestCommand::parse(&msg),
            Some(TestCommand::QueryAuthCode("queryauthcode@@@abc"))
        );
    }

    #[test]
    fn test_ordinary_messages() {
        assert_eq!(TestCommand::parse(&text("hello")), None);
        assert_eq!(TestCommand::parse(&text("TESTCOMPONENT_MSG_TYPE_TEXT ")), None);

        let event = DecodedMessage::parse(
            "<xml><MsgType>event</MsgType><Content>TESTCOMPONENT_MSG_TYPE_TEXT</Content></xml>",
        )
        .unwrap();
        assert_eq!(TestCommand::parse(&event), None);
    }
}
