use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_agent_core::{
    AssistantProfile, ChatController, ChatSettings, DEFAULT_CANCELLED_ACKNOWLEDGEMENT,
    HistoryStore, InMemoryHistoryStore, OrchestratorConfig, SubmitOutcome, TurnDeps, TurnOutcome,
};
use parley_ai::{
    ChatEventStream, ChatTransportRef, ErrorCode, Message, ParleyError, Role, StreamChatOptions,
    StreamIncrement,
};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

enum Reply {
    Stream(Vec<StreamIncrement>),
    Fail(ParleyError),
    Hang(Vec<StreamIncrement>),
    Gated(Arc<Notify>, Vec<StreamIncrement>),
}

struct Script {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl Script {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(vec![]),
        })
    }

    fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn transport(self: &Arc<Self>) -> ChatTransportRef {
        let script = Arc::clone(self);
        Arc::new(
            move |messages: Vec<Message>,
                  _options: StreamChatOptions|
                  -> Result<ChatEventStream, ParleyError> {
                script.requests.lock().expect("requests lock").push(messages);
                let reply = script
                    .replies
                    .lock()
                    .expect("replies lock")
                    .pop_front()
                    .expect("script exhausted");
                let stream = ChatEventStream::new();
                match reply {
                    Reply::Stream(increments) => {
                        for increment in increments {
                            stream.push_increment(increment);
                        }
                        stream.finish();
                    }
                    Reply::Fail(error) => stream.fail(error),
                    Reply::Hang(increments) => {
                        for increment in increments {
                            stream.push_increment(increment);
                        }
                    }
                    Reply::Gated(gate, increments) => {
                        let gated = stream.clone();
                        tokio::spawn(async move {
                            gate.notified().await;
                            for increment in increments {
                                gated.push_increment(increment);
                            }
                            gated.finish();
                        });
                    }
                }
                Ok(stream)
            },
        )
    }
}

fn text(reply: &str) -> Reply {
    Reply::Stream(vec![StreamIncrement::content(reply)])
}

fn controller(script: &Arc<Script>, history: &Arc<InMemoryHistoryStore>) -> ChatController {
    let history: Arc<dyn HistoryStore> = history.clone();
    let deps = TurnDeps::new(script.transport(), history, OrchestratorConfig::default());
    ChatController::new(
        Arc::new(deps),
        ChatSettings::new(
            AssistantProfile::new("helper", "You are a helpful assistant."),
            "openai",
            "gpt-4o",
        ),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(Message::text).collect()
}

#[tokio::test]
async fn submit_requires_active_session_and_input() {
    let script = Script::new(vec![]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);

    let error = chat.submit_text("hi").await.expect_err("no session");
    assert_eq!(error.code, ErrorCode::Validation);

    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");
    let error = chat.submit(vec![]).await.expect_err("empty input");
    assert_eq!(error.code, ErrorCode::Validation);
    assert!(script.requests().is_empty());
}

#[tokio::test]
async fn completed_turn_updates_transcript_and_history() {
    let script = Script::new(vec![text("4")]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let outcome = chat.submit_text("2+2?").await.expect("submit");

    assert!(matches!(
        outcome,
        SubmitOutcome::Finished(TurnOutcome::Completed { .. })
    ));
    let state = chat.state();
    assert_eq!(texts(&state.messages), vec!["2+2?", "4"]);
    assert!(state.draft.is_none());
    assert!(!state.is_streaming);
    assert_eq!(
        history.list("S1").await.expect("history"),
        state.messages
    );
}

#[tokio::test]
async fn switching_session_isolates_stale_turn_updates() {
    let script = Script::new(vec![Reply::Hang(vec![StreamIncrement::content(
        "about session one",
    )])]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.submit_text("tell me about S1").await })
    };
    eventually(|| chat.state().draft.is_some()).await;

    chat.switch_session(Some("S2".to_string()))
        .await
        .expect("switch");
    let state = chat.state();
    assert_eq!(state.session.as_ref().map(|epoch| epoch.session_id()), Some("S2"));
    assert!(state.draft.is_none());
    assert!(state.messages.is_empty());

    let outcome = running.await.expect("join").expect("submit");
    assert!(matches!(
        outcome,
        SubmitOutcome::Finished(TurnOutcome::Cancelled { .. })
    ));
    chat.wait_for_idle().await;

    let state = chat.state();
    assert!(state.messages.is_empty());
    assert!(state.draft.is_none());
    assert!(state.error.is_none());
    assert!(history.list("S2").await.expect("history").is_empty());
    assert_eq!(
        texts(&history.list("S1").await.expect("history")),
        vec!["tell me about S1"]
    );
}

#[tokio::test]
async fn reply_released_after_switch_never_reaches_new_session() {
    let gate = Arc::new(Notify::new());
    let script = Script::new(vec![
        Reply::Gated(gate.clone(), vec![StreamIncrement::content("late S1 answer")]),
        text("S2 answer"),
    ]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.submit_text("question for S1").await })
    };
    eventually(|| script.requests().len() == 1).await;

    chat.switch_session(Some("S2".to_string()))
        .await
        .expect("switch");
    gate.notify_one();
    running.await.expect("join").expect("submit");
    chat.wait_for_idle().await;

    let state = chat.state();
    assert!(state.messages.is_empty());
    assert!(state.draft.is_none());
    assert!(state.error.is_none());
    assert!(history.list("S2").await.expect("history").is_empty());

    chat.submit_text("question for S2").await.expect("submit");
    let state = chat.state();
    assert_eq!(texts(&state.messages), vec!["question for S2", "S2 answer"]);
    assert!(state.draft.is_none());
    assert_eq!(
        texts(&history.list("S2").await.expect("history")),
        vec!["question for S2", "S2 answer"]
    );
    assert!(
        !texts(&history.list("S1").await.expect("history"))
            .contains(&"S2 answer".to_string())
    );
}

#[tokio::test]
async fn dropping_submit_future_does_not_wedge_the_controller() {
    let gate = Arc::new(Notify::new());
    let script = Script::new(vec![
        Reply::Gated(gate.clone(), vec![StreamIncrement::content("first reply")]),
        text("second reply"),
    ]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let abandoned = timeout(Duration::from_millis(100), chat.submit_text("first")).await;
    assert!(abandoned.is_err(), "first turn should still be streaming");
    assert!(chat.state().is_streaming);

    gate.notify_one();
    eventually(|| !chat.state().is_streaming).await;
    assert_eq!(texts(&chat.state().messages), vec!["first", "first reply"]);

    let outcome = chat.submit_text("second").await.expect("submit");
    assert!(matches!(
        outcome,
        SubmitOutcome::Finished(TurnOutcome::Completed { .. })
    ));
    timeout(Duration::from_secs(2), chat.wait_for_idle())
        .await
        .expect("controller goes idle");
    assert_eq!(
        texts(&chat.state().messages),
        vec!["first", "first reply", "second", "second reply"]
    );
}

#[tokio::test]
async fn switching_back_reloads_transcript_from_history() {
    let script = Script::new(vec![text("hello from S1"), text("hello from S2")]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);

    chat.switch_session(Some("S1".to_string())).await.expect("switch");
    chat.submit_text("hi S1").await.expect("submit");
    chat.switch_session(Some("S2".to_string())).await.expect("switch");
    chat.submit_text("hi S2").await.expect("submit");
    chat.switch_session(Some("S1".to_string())).await.expect("switch");

    assert_eq!(
        texts(&chat.state().messages),
        vec!["hi S1", "hello from S1"]
    );

    chat.switch_session(None).await.expect("switch");
    let state = chat.state();
    assert!(state.session.is_none());
    assert!(state.messages.is_empty());
}

#[tokio::test]
async fn retry_after_failure_reports_retry_failed_then_recovers() {
    let script = Script::new(vec![
        Reply::Fail(ParleyError::transport("connection reset")),
        Reply::Fail(ParleyError::transport("still down")),
        text("back online"),
    ]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let error = chat
        .retry()
        .await
        .expect_err("nothing to retry before a failure");
    assert_eq!(error.code, ErrorCode::Validation);

    let SubmitOutcome::Finished(first) = chat.submit_text("hi").await.expect("submit") else {
        panic!("submission should run immediately");
    };
    assert_eq!(
        first.error().map(|error| error.error_type),
        Some(ErrorCode::Transport)
    );
    let state = chat.state();
    assert_eq!(
        state.error.as_ref().map(|error| error.display_message.as_str()),
        Some("connection reset")
    );

    let second = chat.retry().await.expect("retry");
    assert_eq!(
        second.error().map(|error| error.error_type),
        Some(ErrorCode::RetryFailed)
    );
    assert_eq!(
        chat.state().error.map(|error| error.error_type),
        Some(ErrorCode::RetryFailed)
    );

    let third = chat.retry().await.expect("retry");
    assert!(matches!(third, TurnOutcome::Completed { .. }));
    let state = chat.state();
    assert!(state.error.is_none());
    assert_eq!(texts(&state.messages), vec!["hi", "back online"]);

    let requests = script.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|messages| texts(messages) == vec!["hi"]));

    let error = chat.retry().await.expect_err("success clears retry");
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn input_arriving_mid_turn_is_queued_and_drained_in_order() {
    let gate = Arc::new(Notify::new());
    let script = Script::new(vec![
        Reply::Gated(gate.clone(), vec![StreamIncrement::content("first reply")]),
        text("second reply"),
        text("third reply"),
    ]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.submit_text("first").await })
    };
    eventually(|| script.requests().len() == 1).await;

    assert_eq!(
        chat.submit_text("second").await.expect("submit"),
        SubmitOutcome::Queued { position: 1 }
    );
    assert_eq!(
        chat.submit_text("third").await.expect("submit"),
        SubmitOutcome::Queued { position: 2 }
    );
    assert_eq!(chat.state().queued, 2);
    assert!(chat.state().is_streaming);

    gate.notify_one();
    let outcome = running.await.expect("join").expect("submit");
    assert!(matches!(
        outcome,
        SubmitOutcome::Finished(TurnOutcome::Completed { .. })
    ));
    chat.wait_for_idle().await;

    let state = chat.state();
    assert_eq!(state.queued, 0);
    assert!(!state.is_streaming);
    assert_eq!(
        texts(&state.messages),
        vec![
            "first",
            "first reply",
            "second",
            "second reply",
            "third",
            "third reply"
        ]
    );
    let requests = script.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].last().map(Message::text).as_deref(), Some("second"));
    assert_eq!(requests[2].last().map(Message::text).as_deref(), Some("third"));
}

#[tokio::test]
async fn cancel_stops_streaming_and_keeps_queued_input() {
    let script = Script::new(vec![
        Reply::Hang(vec![StreamIncrement::content("a very long")]),
        text("queued answer"),
    ]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let chat = controller(&script, &history);
    chat.switch_session(Some("S1".to_string()))
        .await
        .expect("switch");
    assert!(!chat.cancel(), "nothing in flight yet");

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.submit_text("write an essay").await })
    };
    eventually(|| chat.state().draft.is_some()).await;
    assert_eq!(
        chat.submit_text("and a haiku").await.expect("submit"),
        SubmitOutcome::Queued { position: 1 }
    );

    assert!(chat.cancel());
    let outcome = running.await.expect("join").expect("submit");
    let SubmitOutcome::Finished(TurnOutcome::Cancelled {
        acknowledgement, ..
    }) = outcome
    else {
        panic!("first turn should be cancelled");
    };
    assert_eq!(acknowledgement.text(), DEFAULT_CANCELLED_ACKNOWLEDGEMENT);
    chat.wait_for_idle().await;

    let state = chat.state();
    assert!(state.draft.is_none());
    assert_eq!(
        texts(&state.messages),
        vec![
            "write an essay",
            DEFAULT_CANCELLED_ACKNOWLEDGEMENT,
            "and a haiku",
            "queued answer"
        ]
    );
    assert_eq!(state.messages[1].role, Role::System);

    let stored = texts(&history.list("S1").await.expect("history"));
    assert_eq!(stored, vec!["write an essay", "and a haiku", "queued answer"]);
}
