use std::time::Duration;

use crate::helper::{self, Call, Script};
use crate::{message_from_string, unwrap_incoming_message};
use amqp_session::engine::*;
use amqp_session::*;
use bytes::Bytes;

async fn ready(script: &Script) -> (Session<helper::ScriptedConnector>, ChannelHandle, EventHandler) {
    let mut session = helper::session(script);
    let mut handler = session.subscribe();
    let channel = session.start().await.unwrap();

    assert_eq!(helper::next_event(&mut handler).await.name(), "ready");

    (session, channel, handler)
}

#[tokio::test]
async fn publish_sends_method_then_content() {
    let script = Script::new();
    let (_session, channel, mut handler) = ready(&script).await;

    channel.publish("Hello").await.unwrap();

    let calls = script.calls();

    match &calls[6] {
        Call::BasicPublish(args) => {
            assert_eq!(args.exchange_name, DEFAULT_QUEUE_NAME);
            assert_eq!(args.routing_key, None);
            assert!(args.is_mandatory());
            assert!(!args.is_immediate());
        }
        other => panic!("{other:?} is not a basic publish"),
    }
    assert_eq!(calls[7], Call::Content(Bytes::from_static(b"Hello")));

    match helper::next_event(&mut handler).await {
        SessionEvent::PublishedMessage(body) => assert_eq!(body, Bytes::from_static(b"Hello")),
        other => panic!("{other:?} is not a published message"),
    }
}

#[tokio::test]
async fn publishes_go_out_one_by_one() {
    let script = Script::new().hold("content");
    let (_session, channel, mut handler) = ready(&script).await;

    let drive = async {
        script.wait_for("content").await;

        // Nothing is reported as published until the engine sent the content.
        assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
        assert_eq!(script.count("basic_publish"), 1);

        script.inject(EngineEvent::ContentSent);

        match helper::next_event(&mut handler).await {
            SessionEvent::PublishedMessage(body) => assert_eq!(body, "first".as_bytes()),
            other => panic!("{other:?} is not a published message"),
        }

        script.wait_for_count("content", 2).await;

        assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());

        script.inject(EngineEvent::ContentSent);
    };

    let (first, second, _) = tokio::join!(channel.publish("first"), channel.publish("second"), drive);

    assert!(first.is_ok());
    assert!(second.is_ok());

    let contents: Vec<Call> = script
        .calls()
        .into_iter()
        .filter(|call| call.name() == "content")
        .collect();

    assert_eq!(
        contents,
        vec![
            Call::Content(Bytes::from_static(b"first")),
            Call::Content(Bytes::from_static(b"second"))
        ]
    );

    match helper::next_event(&mut handler).await {
        SessionEvent::PublishedMessage(body) => assert_eq!(body, "second".as_bytes()),
        other => panic!("{other:?} is not a published message"),
    }
}

#[tokio::test]
async fn deliver_emits_incoming_messages() {
    let script = Script::new();
    let (_session, channel, mut handler) = ready(&script).await;

    channel.deliver().await.unwrap();

    let consumer_tag = match script.calls().last() {
        Some(Call::BasicConsume(args)) => {
            assert_eq!(args.queue, DEFAULT_QUEUE_NAME);
            assert_eq!(args.flags, BasicConsumeFlags::NO_ACK | BasicConsumeFlags::EXCLUSIVE);
            assert!(args.consumer_tag.starts_with("amqp-session-"));

            args.consumer_tag.clone()
        }
        other => panic!("{other:?} is not a basic consume"),
    };

    script.inject(EngineEvent::Delivered(message_from_string(&consumer_tag, 1, "first")));
    script.inject(EngineEvent::Delivered(message_from_string(&consumer_tag, 2, "second")));

    let first = unwrap_incoming_message(helper::next_event(&mut handler).await);
    let second = unwrap_incoming_message(helper::next_event(&mut handler).await);

    assert_eq!(first.text(), Some("first"));
    assert_eq!(first.delivery_tag, 1);
    assert_eq!(second.text(), Some("second"));
    assert_eq!(second.consumer_tag, consumer_tag);
}

#[tokio::test]
async fn second_deliver_fails() {
    let script = Script::new();
    let (_session, channel, _handler) = ready(&script).await;

    channel.deliver().await.unwrap();

    let err = helper::to_client_error(channel.deliver().await);

    assert_eq!(err.code, ConnectionError::CommandInvalid as u16);
    assert_eq!(script.count("basic_consume"), 1);
}

#[tokio::test]
async fn close_releases_listeners_then_transport() {
    let script = Script::new();
    let (session, channel, mut handler) = ready(&script).await;

    channel.close().await.unwrap();

    assert_eq!(session.phase(), Phase::Closed);
    assert!(!script.has_listener());
    assert_eq!(
        script.call_names()[6..].to_vec(),
        vec!["close", "remove_all_listeners", "terminate"]
    );
    assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn no_events_after_close_begins() {
    let script = Script::new().hold("close");
    let (_session, channel, mut handler) = ready(&script).await;

    channel.deliver().await.unwrap();

    let drive = async {
        script.wait_for("close").await;

        script.inject(EngineEvent::Delivered(message_from_string("late", 1, "late")));
        script.inject(EngineEvent::TransportError("connection reset".to_string()));
        script.inject(EngineEvent::CommunicationClosed);
    };

    let (result, _) = tokio::join!(channel.close(), drive);

    assert!(result.is_err());
    assert_eq!(script.count("terminate"), 1);
    assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn returned_message_is_not_a_fault() {
    let script = Script::new();
    let (session, channel, mut handler) = ready(&script).await;

    script.inject(EngineEvent::Returned(ReturnedMessage {
        body: Bytes::from_static(b"lost"),
        reply_code: ChannelError::NoRoute as u16,
        reply_text: "NO_ROUTE".to_string(),
        exchange: DEFAULT_QUEUE_NAME.to_string(),
        routing_key: String::new(),
    }));

    channel.publish("after return").await.unwrap();

    assert_eq!(session.phase(), Phase::Ready);
    assert_eq!(helper::next_event(&mut handler).await.name(), "published.message");
}

#[tokio::test]
async fn transport_error_after_ready_is_reported() {
    let script = Script::new().hold("basic_consume");
    let (session, channel, mut handler) = ready(&script).await;

    let drive = async {
        script.wait_for("basic_consume").await;
        script.inject(EngineEvent::TransportError("connection reset by peer".to_string()));
    };

    let (result, _) = tokio::join!(channel.deliver(), drive);
    let err = helper::to_client_error(result);

    assert_eq!(err.code, ConnectionError::ConnectionForced as u16);
    assert_eq!(session.phase(), Phase::Ready);

    match helper::next_event(&mut handler).await {
        SessionEvent::Error(e) => {
            assert_eq!(e.channel, None);
            assert_eq!(e.message, "connection reset by peer");
        }
        other => panic!("{other:?} is not an error"),
    }
}

#[tokio::test]
async fn dropping_the_handle_closes_the_session() {
    let script = Script::new();
    let (_session, channel, _handler) = ready(&script).await;

    drop(channel);

    script.wait_for("terminate").await;

    assert_eq!(script.count("close"), 1);
    assert!(!script.has_listener());
}
