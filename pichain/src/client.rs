//! # Summary
//!
//! This module owns every TCP connection to a client: accepting
//! connections on the client port, parsing line-delimited `put`/`get`
//! commands, and writing one response line per request. Parsing and
//! formatting live here so `Node::handle_event` only ever sees the typed
//! `ClientRequest`/`ClientResponse` values from `crate::message`.
//!
//! One task per connection, forwarding both directions, but a
//! connection task here never touches replicated state — it registers a
//! `ClientHandle` with the event loop and only ferries parsed lines
//! across the shared event channel, the same pattern `crate::transport`
//! uses for peers.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::message::ClientRequest;
use crate::transport::{ClientHandle, Event};

pub async fn listen(bind_addr: String, events: mpsc::Sender<Event>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("client listener bound on {}", bind_addr);
    let mut next_client_id: u64 = 0;
    loop {
        let (stream, remote) = listener.accept().await?;
        let client_id = next_client_id;
        next_client_id += 1;
        log::debug!("accepted client {} from {}", client_id, remote);
        let events = events.clone();
        tokio::spawn(run_connection(client_id, stream, events));
    }
}

async fn run_connection(client_id: u64, stream: TcpStream, events: mpsc::Sender<Event>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if events
        .send(Event::ClientConnected(client_id, ClientHandle::new(tx)))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        match parse_request(&text) {
                            Some(request) => {
                                if events.send(Event::FromClient(client_id, request)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write_half.write_all(b"err malformed command\n").await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::warn!("client {} read error: {}", client_id, err);
                        break;
                    }
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(line) => {
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = events.send(Event::ClientDisconnected(client_id)).await;
}

/// Parses one line of the client protocol: `put <key> <value>` or
/// `get <key>`. Keys and values are opaque byte strings without
/// whitespace, so splitting on ASCII spaces is sufficient. Sequence
/// number assignment happens in `Node`, not here: the wire protocol
/// carries none.
fn parse_request(line: &str) -> Option<ClientRequest> {
    let mut parts = line.trim_end().splitn(3, ' ');
    match parts.next()? {
        "put" => {
            let key = parts.next()?.as_bytes().to_vec();
            let value = parts.next()?.as_bytes().to_vec();
            Some(ClientRequest::Put { key, value })
        }
        "get" => {
            let key = parts.next()?.as_bytes().to_vec();
            Some(ClientRequest::Get { key })
        }
        _ => None,
    }
}

/// Renders a response as the single line written back to the client.
pub fn format_response(response: &crate::message::ClientResponse) -> String {
    use crate::message::ClientResponse;
    match response {
        ClientResponse::Committed { key, value } => format!(
            "put {} {}\n",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        ),
        ClientResponse::Value { key, value: Some(value) } => format!(
            "value {} {}\n",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        ),
        ClientResponse::Value { key, value: None } => {
            format!("value {} <absent>\n", String::from_utf8_lossy(key))
        }
        ClientResponse::Err { reason } => format!("err {}\n", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put() {
        let request = parse_request("put alpha beta").unwrap();
        assert_eq!(request, ClientRequest::Put { key: b"alpha".to_vec(), value: b"beta".to_vec() });
    }

    #[test]
    fn parses_get() {
        let request = parse_request("get alpha").unwrap();
        assert_eq!(request, ClientRequest::Get { key: b"alpha".to_vec() });
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(parse_request("delete alpha").is_none());
    }

    #[test]
    fn rejects_missing_value() {
        assert!(parse_request("put alpha").is_none());
    }
}
