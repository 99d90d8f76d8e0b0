mod common;

use article_assistant::config::UnknownConversation;
use article_assistant::conversation::{ConversationStore, InMemoryConversationStore};
use article_assistant::error::ChatError;
use article_assistant::models::Role;
use article_assistant::orchestrator::{ChatRequest, ChatSettings, Orchestrator};
use article_assistant::stream::StreamEvent;
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn happy_setup() -> (
    Arc<StaticRetriever>,
    Arc<ScriptedGenerator>,
    Arc<InMemoryConversationStore>,
    Orchestrator,
) {
    let retriever = Arc::new(StaticRetriever::new(vec![
        pricing_fragment(),
        fragment(7, "Cloud Costs", "Reserved instances cut costs."),
    ]));
    let generator = Arc::new(ScriptedGenerator::answering(&["Prices ", "rose ", "20% [1]."]));
    let store = Arc::new(InMemoryConversationStore::new());
    let orch = orchestrator(retriever.clone(), generator.clone(), store.clone());
    (retriever, generator, store, orch)
}

#[tokio::test]
async fn test_scoped_question_ends_with_cited_done() {
    let (retriever, _, store, orch) = happy_setup();

    let rx = orch
        .handle(ChatRequest::new("What did article 42 say about pricing?").scoped_to(vec![42]))
        .await
        .unwrap();
    let events = collect(rx).await;

    assert!(!answer_text(&events).is_empty());
    match events.last().unwrap() {
        StreamEvent::Done { sources, .. } => {
            assert_eq!(sources, &vec![source(42, "Pricing Deep Dive")]);
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(retriever.scopes(), vec![Some(vec![42])]);
    assert_eq!(store.turn_count(), 2);
}

#[tokio::test]
async fn test_exactly_one_terminal_event_and_it_is_last() {
    let (_, _, _, orch) = happy_setup();

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(answer_text(&events), "Prices rose 20% [1].");
}

#[tokio::test]
async fn test_failure_after_two_chunks_persists_nothing() {
    let retriever = Arc::new(StaticRetriever::new(vec![pricing_fragment()]));
    let generator = Arc::new(ScriptedGenerator::failing_after(
        &["Prices ", "rose"],
        "upstream reset",
    ));
    let store = Arc::new(InMemoryConversationStore::new());
    let orch = orchestrator(retriever, generator, store.clone());

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0], StreamEvent::content("Prices "));
    assert_eq!(events[1], StreamEvent::content("rose"));
    match &events[2] {
        StreamEvent::Error { error } => assert!(error.contains("upstream reset")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(store.turn_count(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_client_abort_cancels_generation_and_skips_persistence() {
    let retriever = Arc::new(StaticRetriever::new(vec![pricing_fragment()]));
    let generator = Arc::new(HangingGenerator::new());
    let cancelled = generator.cancelled.clone();
    let store = Arc::new(InMemoryConversationStore::new());
    let orch = orchestrator(retriever, generator, store.clone());

    let mut rx = orch.handle(ChatRequest::new("pricing?")).await.unwrap();
    assert_eq!(rx.recv().await, Some(StreamEvent::content("Pric")));
    drop(rx);

    assert!(wait_for(&cancelled).await, "generation stream was not dropped");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.turn_count(), 0);
}

#[tokio::test]
async fn test_missing_conversation_id_is_minted_once() {
    let (_, _, store, orch) = happy_setup();

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    let ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Done {
                conversation_id, ..
            } => Some(conversation_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 1);
    let id = ids[0];

    let first = store.read_history(id).await.unwrap();
    let second = store.read_history(id).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert!(first.iter().all(|t| t.conversation_id == id));
    assert!(store.get(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_follow_up_sees_history_in_order() {
    let (_, generator, store, orch) = happy_setup();

    let first = collect(orch.handle(ChatRequest::new("first question")).await.unwrap()).await;
    let id = match first.last().unwrap() {
        StreamEvent::Done {
            conversation_id, ..
        } => conversation_id.clone(),
        other => panic!("expected done, got {:?}", other),
    };

    let second = collect(
        orch.handle(ChatRequest::new("second question").in_conversation(id.clone()))
            .await
            .unwrap(),
    )
    .await;
    match second.last().unwrap() {
        StreamEvent::Done {
            conversation_id, ..
        } => assert_eq!(conversation_id, &id),
        other => panic!("expected done, got {:?}", other),
    }

    let prompt = generator.last_prompt();
    let roles: Vec<&str> = prompt.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    assert_eq!(prompt.messages[1].content, "first question");
    assert_eq!(prompt.question(), "second question");

    let history = store.read_history(&id).await.unwrap();
    let roles: Vec<Role> = history.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert!(history[1].sources.iter().any(|s| s.id == 42));
}

#[tokio::test]
async fn test_empty_message_is_rejected_before_streaming() {
    let (retriever, _, store, orch) = happy_setup();

    for message in ["", "   \n\t"] {
        let err = orch.handle(ChatRequest::new(message)).await.unwrap_err();
        assert!(matches!(err, ChatError::MalformedRequest(_)));
    }
    assert!(retriever.scopes().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let (_, _, _, orch) = happy_setup();
    let message = "x".repeat(ChatSettings::default().max_message_chars + 1);
    let err = orch.handle(ChatRequest::new(message)).await.unwrap_err();
    assert!(matches!(err, ChatError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_invalid_scope_is_rejected() {
    let (_, _, _, orch) = happy_setup();

    let err = orch
        .handle(ChatRequest::new("q").scoped_to(vec![42, 0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::MalformedRequest(_)));

    let too_many: Vec<i64> = (1..=(ChatSettings::default().max_scope_ids as i64 + 1)).collect();
    let err = orch
        .handle(ChatRequest::new("q").scoped_to(too_many))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_empty_scope_means_whole_library() {
    let (retriever, _, _, orch) = happy_setup();

    let events = collect(
        orch.handle(ChatRequest::new("pricing?").scoped_to(Vec::new()))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(retriever.scopes(), vec![None]);
    match events.last().unwrap() {
        StreamEvent::Done { sources, .. } => assert_eq!(sources.len(), 2),
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_conversation_is_rejected_by_default() {
    let (_, _, store, orch) = happy_setup();

    let err = orch
        .handle(ChatRequest::new("q").in_conversation("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::ConversationNotFound(ref id) if id == "nope"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_unknown_conversation_can_be_adopted() {
    let store = Arc::new(InMemoryConversationStore::new());
    let settings = ChatSettings {
        unknown_conversation: UnknownConversation::Adopt,
        ..ChatSettings::default()
    };
    let orch = Orchestrator::new(
        Arc::new(StaticRetriever::new(vec![pricing_fragment()])),
        Arc::new(ScriptedGenerator::answering(&["ok"])),
        store.clone(),
        settings,
    );

    let events = collect(
        orch.handle(ChatRequest::new("q").in_conversation("client-42"))
            .await
            .unwrap(),
    )
    .await;

    match events.last().unwrap() {
        StreamEvent::Done {
            conversation_id, ..
        } => assert_eq!(conversation_id, "client-42"),
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(store.read_history("client-42").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retrieval_failure_degrades_to_empty_context() {
    let generator = Arc::new(ScriptedGenerator::answering(&["No articles matched."]));
    let orch = orchestrator(
        Arc::new(FailingRetriever),
        generator.clone(),
        Arc::new(InMemoryConversationStore::new()),
    );

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    match events.last().unwrap() {
        StreamEvent::Done { sources, .. } => assert!(sources.is_empty()),
        other => panic!("expected done, got {:?}", other),
    }
    assert!(generator.last_prompt().system().contains("none were found"));
}

#[tokio::test]
async fn test_retrieval_timeout_degrades_to_empty_context() {
    let orch = orchestrator(
        Arc::new(SlowRetriever),
        Arc::new(ScriptedGenerator::answering(&["Nothing relevant."])),
        Arc::new(InMemoryConversationStore::new()),
    );

    let events = tokio::time::timeout(
        Duration::from_secs(5),
        collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()),
    )
    .await
    .expect("retrieval timeout was not applied");

    match events.last().unwrap() {
        StreamEvent::Done { sources, .. } => assert!(sources.is_empty()),
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_generation_rejected_up_front_is_in_band_error() {
    let store = Arc::new(InMemoryConversationStore::new());
    let orch = orchestrator(
        Arc::new(StaticRetriever::new(vec![pricing_fragment()])),
        Arc::new(RefusingGenerator),
        store.clone(),
    );

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { error } => assert!(error.contains("401")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_empty_answer_is_an_error() {
    let store = Arc::new(InMemoryConversationStore::new());
    let orch = orchestrator(
        Arc::new(StaticRetriever::default()),
        Arc::new(ScriptedGenerator::answering(&[])),
        store.clone(),
    );

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    assert!(matches!(events.last().unwrap(), StreamEvent::Error { .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_persistence_failure_is_reported_in_band() {
    let orch = orchestrator(
        Arc::new(StaticRetriever::new(vec![pricing_fragment()])),
        Arc::new(ScriptedGenerator::answering(&["Prices rose."])),
        Arc::new(ReadOnlyStore::default()),
    );

    let events = collect(orch.handle(ChatRequest::new("pricing?")).await.unwrap()).await;

    assert_eq!(events[0], StreamEvent::content("Prices rose."));
    match events.last().unwrap() {
        StreamEvent::Error { error } => assert!(error.contains("database is locked")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_requests_in_one_conversation() {
    let (_, _, store, orch) = happy_setup();
    let id = store
        .create_or_append(Some("shared"), &[])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let orch = orch.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let rx = orch
                .handle(ChatRequest::new(format!("question {}", i)).in_conversation(id))
                .await
                .unwrap();
            collect(rx).await
        }));
    }
    for h in handles {
        let events = h.await.unwrap();
        assert!(matches!(events.last().unwrap(), StreamEvent::Done { .. }));
    }

    let history = store.read_history(&id).await.unwrap();
    assert_eq!(history.len(), 12);
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}
