//! In-process mock device for tests.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::util::codec::Request;

/// A terminated success response frame.
pub(crate) fn reply(id: u64, result: Value) -> Vec<u8> {
    let mut frame = json!({ "id": id, "result": result }).to_string().into_bytes();
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Listens on `bind` and answers every request line with `respond`.
///
/// Every parsed request is forwarded to the returned receiver. An empty reply
/// sends nothing back.
pub(crate) async fn spawn_mock_device<F>(
    bind: &str,
    respond: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<Request>)
where
    F: Fn(&Request) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind(bind).await.unwrap();
    let address = listener.local_addr().unwrap();
    let (sender, receiver) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let respond = respond.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(request) => request,
                        Err(_) => continue,
                    };
                    let frame = respond(&request);
                    let _ = sender.send(request);
                    if !frame.is_empty() && write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (address, receiver)
}
