use amqp_session::*;
use anyhow::Result;
use log::{error, info};
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> Result<()> {
    amqp_session::setup_logger();

    let params = ConnectionParameters::default().with_credentials("guest", "guest");
    let topology = Topology::new("q_pubsub", "x_pubsub", "direct");

    let mut session = Session::new(params, topology);
    session.set_verbose(true);
    session.set_handshake_timeout(Some(Duration::from_secs(5)));

    let mut handler = session.subscribe();
    let channel = session.start().await?;

    channel.deliver().await?;

    let message_count = 256u32;
    let message = "This will be the test message what we send over multiple times";

    let start = Instant::now();

    for _ in 0..message_count {
        channel.publish(message).await?;
    }

    let mut received = 0u32;

    while received < message_count {
        match handler.receive_event(Duration::from_secs(5)).await {
            Some(SessionEvent::IncomingMessage(_)) => received += 1,
            Some(SessionEvent::Error(e)) => {
                error!("Session error {:?}", e);
                break;
            }
            Some(_) => (),
            None => {
                error!("No message arrived in 5 seconds");
                break;
            }
        }
    }

    info!(
        "Send and receive {}/{} messages: {:?}",
        received,
        message_count,
        Instant::elapsed(&start)
    );

    channel.close().await?;

    Ok(())
}
