use crate::engine::{EngineEvent, ProtocolEngine};
use crate::state::{Response, SessionState};
use crate::client_error;
use anyhow::Result;
use bytes::Bytes;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

/// Requests of the client api to the session task.
#[derive(Debug)]
pub(crate) enum Param {
    Deliver,
    Publish(Bytes),
    Close,
    /// Give up the handshake with the reason.
    Abort(String),
}

#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) param: Param,
    pub(crate) response: Option<Response>,
}

pub(crate) type RequestSink = mpsc::Sender<Request>;

/// The session task. Processes the engine events and the client requests one by one until
/// the session is closed or every handle is dropped.
pub(crate) async fn session_loop<E: ProtocolEngine>(
    mut state: SessionState<E>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    mut requests: mpsc::Receiver<Request>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => state.handle_event(event),
                    None => {
                        debug!("Engine event stream is closed");
                        break;
                    }
                }
            }
            req = requests.recv() => {
                match req {
                    Some(request) => handle_request(request, &mut state),
                    None => {
                        info!("Every session handle is dropped, closing");

                        let (tx, _rx) = oneshot::channel();
                        state.close(tx);

                        // Wait for the close ack, the requests are gone.
                        while !state.is_closed() {
                            match events.recv().await {
                                Some(event) => state.handle_event(event),
                                None => break,
                            }
                        }

                        break;
                    }
                }
            }
        }

        if state.is_closed() {
            break;
        }
    }

    debug!("Session loop is finished {:?}", state);
}

fn handle_request<E: ProtocolEngine>(request: Request, state: &mut SessionState<E>) {
    debug!("Incoming client request {:?}", request.param);

    let response = match request.response {
        Some(response) => response,
        None => {
            let (tx, _rx) = oneshot::channel();
            tx
        }
    };

    match request.param {
        Param::Deliver => state.deliver(response),
        Param::Publish(body) => state.publish(body, response),
        Param::Close => state.close(response),
        Param::Abort(reason) => {
            state.abort(&reason);

            let _ = response.send(Ok(()));
        }
    }
}

/// Sends a request to the session task and waits for its outcome.
pub(crate) async fn call(sink: &RequestSink, param: Param) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    if sink
        .send(Request {
            param,
            response: Some(tx),
        })
        .await
        .is_err()
    {
        return connection_lost();
    }

    match rx.await {
        Ok(result) => result,
        Err(_) => connection_lost(),
    }
}

fn connection_lost() -> Result<()> {
    client_error!(None, 0, "Connection closed by peer")
}
