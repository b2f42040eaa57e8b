/// Per-connection read and write loops
///
/// The read loop dispatches client frames and keeps the connection's
/// last-seen time fresh; the write loop drains the outbound channel and
/// pings peers that have been silent for `PING_INTERVAL`, however busy the
/// outbound side is. Whichever loop ends first cancels the other.
use super::hub::{Client, ClientChannels, Hub};
use super::{Frame, FrameKind, InboundFrame};
use crate::account::User;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::debug;

/// Deadline for each read
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for each write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read silence before a protocol ping
pub const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Run an upgraded socket until either side closes it
pub async fn serve(socket: WebSocket, hub: Hub, user: User) {
    let (client, channels) = hub.connect(&user);
    hub.register(Arc::clone(&client)).await;

    let (sink, stream) = socket.split();
    run(sink, stream, &hub, client, channels).await;
}

/// Drive both loops over any message sink and stream
pub async fn run<S, R>(sink: S, stream: R, hub: &Hub, client: Arc<Client>, channels: ClientChannels)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let ClientChannels { outbound, cancel } = channels;

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        cancel.clone(),
        Arc::clone(&client),
    ));

    read_loop(stream, hub, &client, cancel).await;

    client.cancel();
    hub.unregister(Arc::clone(&client)).await;
    let _ = writer.await;

    debug!(
        conn_id = client.conn_id,
        user_id = client.user_id,
        "Connection closed"
    );
}

async fn read_loop<R>(mut stream: R, hub: &Hub, client: &Arc<Client>, mut cancel: watch::Receiver<bool>)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if *cancel.borrow() {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            next = timeout(READ_TIMEOUT, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(conn_id = client.conn_id, "Read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id = client.conn_id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        client.touch();

        match message {
            Message::Text(text) => handle_frame(hub, client, &text).await,
            Message::Close(_) => {
                debug!(conn_id = client.conn_id, "Client closed connection");
                break;
            }
            // Pings are answered by the protocol layer; pongs only count as activity
            _ => {}
        }
    }
}

async fn handle_frame(hub: &Hub, client: &Client, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id = client.conn_id, error = %e, "Malformed client frame");
            reply(client, FrameKind::Error("Malformed frame".to_string()));
            return;
        }
    };

    match frame.kind.as_str() {
        "user_typing" => {
            let is_typing = frame
                .payload
                .get("is_typing")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let typing = Frame::new(FrameKind::UserTyping {
                user_id: client.user_id,
                user_name: client.user_name.clone(),
                is_typing,
            });
            hub.broadcast(client.family_id, &typing).await;
        }
        "heartbeat" => reply(client, FrameKind::Heartbeat("pong".to_string())),
        other => debug!(conn_id = client.conn_id, kind = other, "Ignoring unknown frame type"),
    }
}

/// Queue a frame for this connection alone
fn reply(client: &Client, kind: FrameKind) {
    if let Ok(text) = Frame::new(kind).encode() {
        if !client.send(text) {
            debug!(conn_id = client.conn_id, "Reply dropped, outbound channel unavailable");
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Arc<str>>,
    mut cancel: watch::Receiver<bool>,
    client: Arc<Client>,
) where
    S: Sink<Message> + Unpin,
{
    let ping = sleep_until(client.last_seen() + PING_INTERVAL);
    tokio::pin!(ping);

    if !*cancel.borrow() {
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if !write(&mut sink, Message::Text(text.to_string())).await {
                            break;
                        }
                    }
                    // The hub closed this connection
                    None => break,
                },
                _ = &mut ping => {
                    if client.idle_for() < PING_INTERVAL {
                        ping.as_mut().reset(client.last_seen() + PING_INTERVAL);
                        continue;
                    }
                    if !write(&mut sink, Message::Ping(Vec::new())).await {
                        debug!(conn_id = client.conn_id, "Ping failed");
                        break;
                    }
                    ping.as_mut().reset(Instant::now() + PING_INTERVAL);
                }
            }
        }
    }

    let _ = write(&mut sink, Message::Close(None)).await;
    client.cancel();
}

async fn write<S>(sink: &mut S, message: Message) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(timeout(WRITE_TIMEOUT, sink.send(message)).await, Ok(Ok(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    fn user(id: u64) -> User {
        User {
            id,
            family_id: 7,
            name: format!("user-{}", id),
        }
    }

    async fn next_type(rx: &mut fmpsc::UnboundedReceiver<Message>) -> String {
        loop {
            match rx.next().await.unwrap() {
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    return value["type"].as_str().unwrap().to_string();
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_and_typing() {
        let hub = Hub::start();
        let (client, channels) = hub.connect(&user(10));
        hub.register(Arc::clone(&client)).await;

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let task_hub = hub.clone();
        let task = tokio::spawn(async move {
            run(out_tx, in_rx, &task_hub, client, channels).await;
        });

        assert_eq!(next_type(&mut out_rx).await, "user_online");

        in_tx
            .unbounded_send(Ok(Message::Text(r#"{"type":"heartbeat","payload":"ping"}"#.into())))
            .unwrap();
        assert_eq!(next_type(&mut out_rx).await, "heartbeat");

        in_tx
            .unbounded_send(Ok(Message::Text(
                r#"{"type":"user_typing","payload":{"is_typing":true}}"#.into(),
            )))
            .unwrap();
        assert_eq!(next_type(&mut out_rx).await, "user_typing");

        in_tx
            .unbounded_send(Ok(Message::Text(r#"{"type":"mystery"}"#.into())))
            .unwrap();
        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();

        assert_eq!(hub.connection_count(7), 0);
    }

    #[tokio::test]
    async fn test_hub_cancel_ends_both_loops() {
        let hub = Hub::start();
        let (client, channels) = hub.connect(&user(11));
        hub.register(Arc::clone(&client)).await;

        let (out_tx, _out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let task_hub = hub.clone();
        let task_client = Arc::clone(&client);
        let task = tokio::spawn(async move {
            run(out_tx, in_rx, &task_hub, task_client, channels).await;
        });

        client.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.connection_count(7), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_only_peer_is_pinged_while_frames_flow() {
        let hub = Hub::start();
        let (client, channels) = hub.connect(&user(12));
        hub.register(Arc::clone(&client)).await;

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();

        let task_hub = hub.clone();
        let task_client = Arc::clone(&client);
        let task = tokio::spawn(async move {
            run(out_tx, in_rx, &task_hub, task_client, channels).await;
        });

        // Other family members keep chatting; this peer never speaks first
        let chatter_client = Arc::clone(&client);
        let chatter = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let text = Frame::new(FrameKind::Heartbeat("chatter".into())).encode().unwrap();
                chatter_client.send(text);
            }
        });

        let started = Instant::now();
        for _ in 0..3 {
            loop {
                match out_rx.next().await.unwrap() {
                    Message::Ping(_) => break,
                    _ => continue,
                }
            }
            assert!(client.idle_for() < READ_TIMEOUT);
            in_tx.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
        }

        assert!(started.elapsed() > READ_TIMEOUT * 2);
        assert_eq!(hub.connection_count(7), 1);

        chatter.abort();
        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();
        assert_eq!(hub.connection_count(7), 0);
    }
}
