use std::time::Duration;

use crate::helper::{self, Script};
use amqp_session::engine::*;
use amqp_session::*;

#[tokio::test]
async fn connect_failure_emits_error_and_no_ready() {
    let script = Script::new().failing_connect();
    let mut session = helper::session(&script);
    let mut handler = session.subscribe();

    let result = session.start().await;

    assert!(result.is_err());
    assert_eq!(script.call_names(), vec!["specification", "connect"]);

    match helper::next_event(&mut handler).await {
        SessionEvent::Error(e) => assert!(e.message.contains("Connection refused")),
        other => panic!("{other:?} is not an error"),
    }
    assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn specification_failure_never_connects() {
    let script = Script::new().rejecting_specification();
    let mut session = helper::session(&script);
    let mut handler = session.subscribe();

    assert!(session.start().await.is_err());
    assert_eq!(script.call_names(), vec!["specification"]);
    assert_eq!(session.phase(), Phase::Idle);
    assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn transport_error_during_handshake_fails_start() {
    let script = Script::new().hold("queue_declare");
    let mut session = helper::session(&script);
    let mut handler = session.subscribe();

    let drive = async {
        script.wait_for("queue_declare").await;
        script.inject(EngineEvent::TransportError("broken pipe".to_string()));
    };

    let (result, _) = tokio::join!(session.start(), drive);
    let err = helper::to_client_error(result);

    assert_eq!(err.code, ConnectionError::ConnectionForced as u16);
    assert_eq!(session.phase(), Phase::QueueDeclaring);
    assert_eq!(helper::next_event(&mut handler).await.name(), "error");
}

#[tokio::test]
async fn lapin_engine_rejects_unknown_specification() {
    let config = SessionConfig::from_toml(
        r#"
        specification = "amqp1-0"

        [connection]
        port = 1
        "#,
    )
    .unwrap();

    let mut session = Session::from_config(config);
    let mut handler = session.subscribe();

    let err = helper::to_client_error(session.start().await);

    assert_eq!(err.code, ConnectionError::NotImplemented as u16);
    assert!(handler.receive_event(Duration::from_millis(50)).await.is_none());
}
