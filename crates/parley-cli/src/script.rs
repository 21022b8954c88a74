use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use parley_ai::{
    ChatEventStream, ChatTransport, Message, ParleyError, Role, StreamChatOptions, StreamIncrement,
};
use serde::Deserialize;
use tracing::debug;

/// One scripted model reply: either a sequence of increments or a failure.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScriptedReply {
    Fail { error: ParleyError },
    Stream(Vec<StreamIncrement>),
}

/// Offline model source that replays replies from a JSON file, one per
/// request. Once the script runs out it echoes the latest user message.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|error| format!("read script {} failed: {error}", path.display()))?;
        Self::parse(&content)
            .map_err(|error| format!("parse script {} failed: {error}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        let replies: Vec<ScriptedReply> = serde_json::from_str(content)?;
        Ok(Self::new(replies))
    }

    pub fn remaining(&self) -> usize {
        self.replies().len()
    }

    fn replies(&self) -> MutexGuard<'_, VecDeque<ScriptedReply>> {
        self.replies
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl ChatTransport for ScriptedTransport {
    fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: StreamChatOptions,
    ) -> Result<ChatEventStream, ParleyError> {
        let reply = self
            .replies()
            .pop_front()
            .unwrap_or_else(|| echo_reply(&messages));
        debug!(
            provider = options.config.provider.as_str(),
            model = options.config.model.as_str(),
            messages = messages.len(),
            tools = options.tools.len(),
            "scripted request"
        );

        let stream = ChatEventStream::new();
        match reply {
            ScriptedReply::Fail { error } => stream.fail(error),
            ScriptedReply::Stream(increments) => {
                for increment in increments {
                    stream.push_increment(increment);
                }
                stream.finish();
            }
        }
        Ok(stream)
    }
}

fn echo_reply(messages: &[Message]) -> ScriptedReply {
    let last_user = messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(Message::text)
        .unwrap_or_default();
    let mut increments = vec![StreamIncrement::content("echo:")];
    increments.extend(
        last_user
            .split_whitespace()
            .map(|word| StreamIncrement::content(format!(" {word}"))),
    );
    ScriptedReply::Stream(increments)
}

#[cfg(test)]
mod tests {
    use parley_ai::{ChatStreamEvent, ErrorCode};

    use super::*;

    async fn drain(stream: &ChatEventStream) -> Vec<ChatStreamEvent> {
        let mut events = vec![];
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn replays_scripted_replies_in_order_then_echoes() {
        let transport = ScriptedTransport::parse(
            r#"[
                [{"content": "Hello"}, {"content": " there"}],
                {"error": {"code": "transport", "message": "connection reset"}}
            ]"#,
        )
        .expect("script");
        assert_eq!(transport.remaining(), 2);

        let first = transport
            .stream_chat(vec![Message::user_text("hi")], StreamChatOptions::default())
            .expect("stream");
        assert_eq!(drain(&first).await.len(), 3);

        let second = transport
            .stream_chat(vec![Message::user_text("hi")], StreamChatOptions::default())
            .expect("stream");
        let Some(Err(error)) = second.result().await else {
            panic!("second reply should fail");
        };
        assert_eq!(error.code, ErrorCode::Transport);

        let third = transport
            .stream_chat(
                vec![Message::user_text("say   it back")],
                StreamChatOptions::default(),
            )
            .expect("stream");
        let text: String = drain(&third)
            .await
            .into_iter()
            .filter_map(|event| match event {
                ChatStreamEvent::Increment(increment) => increment.content,
                _ => None,
            })
            .collect();
        assert_eq!(text, "echo: say it back");
    }

    #[test]
    fn script_with_tool_call_deltas_parses() {
        let transport = ScriptedTransport::parse(
            r#"[[{"tool_calls": [{"id": "t1", "index": 0, "function": {"name": "builtin.calc__add", "arguments": "{\"a\":2,\"b\":3}"}}]}]]"#,
        )
        .expect("script");
        let replies = transport.replies();
        let Some(ScriptedReply::Stream(increments)) = replies.front() else {
            panic!("expected streamed reply");
        };
        assert_eq!(increments[0].tool_calls[0].id.as_deref(), Some("t1"));
    }
}
