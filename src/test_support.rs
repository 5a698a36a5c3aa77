//! In-process fake gateway for tests.
//!
//! [`FakeGateway::spawn`] hands each accepted socket to the test as a
//! [`ServerConn`] to drive by hand. [`FakeGateway::spawn_auto`] runs the
//! handshake itself and answers every request through a callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Responder = dyn Fn(&str, &Value) -> Result<Value, Value> + Send + Sync;

pub struct FakeGateway {
    pub url: String,
    accepted: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeGateway {
    /// Manual mode: every accepted socket is queued for [`Self::next_conn`].
    pub async fn spawn() -> Self {
        Self::start(None).await
    }

    /// Auto mode: challenge, accept any `connect`, answer the rest with `responder`.
    pub async fn spawn_auto<F>(responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self::start(Some(Arc::new(responder))).await
    }

    async fn start(responder: Option<Arc<Responder>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (tx, conns) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let conn = ServerConn { ws };
                match &responder {
                    Some(responder) => {
                        tokio::spawn(serve_auto(conn, Arc::clone(responder), Arc::clone(&log)));
                    }
                    None => {
                        let _ = tx.send(conn);
                    }
                }
            }
        });

        Self {
            url,
            accepted,
            conns,
            requests,
        }
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(RECV_TIMEOUT, self.conns.recv())
            .await
            .expect("timed out waiting for a client connection")
            .expect("listener stopped")
    }

    /// Sockets accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Non-handshake requests seen in auto mode.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_auto(mut conn: ServerConn, responder: Arc<Responder>, log: Arc<Mutex<Vec<Value>>>) {
    conn.challenge().await;
    while let Some(req) = conn.recv_json().await {
        let id = req["id"].as_str().unwrap_or_default().to_string();
        let method = req["method"].as_str().unwrap_or_default().to_string();
        if method == "connect" {
            conn.respond_ok(&id, json!({})).await;
            continue;
        }
        log.lock().unwrap().push(req.clone());
        match responder(&method, &req["params"]) {
            Ok(payload) => conn.respond_ok(&id, payload).await,
            Err(error) => conn.respond_err(&id, error).await,
        }
    }
}

/// Server side of one accepted socket.
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn challenge(&mut self) {
        self.send_json(json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n"}}))
            .await;
    }

    pub async fn respond_ok(&mut self, id: &str, payload: Value) {
        self.send_json(json!({"type": "res", "id": id, "ok": true, "payload": payload}))
            .await;
    }

    pub async fn respond_err(&mut self, id: &str, error: Value) {
        self.send_json(json!({"type": "res", "id": id, "ok": false, "error": error}))
            .await;
    }

    /// Next JSON text frame. `None` once the client closes.
    pub async fn recv_json(&mut self) -> Option<Value> {
        self.try_recv(RECV_TIMEOUT).await
    }

    /// Like [`Self::recv_json`] but gives up after `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        let next = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(&text).ok();
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                    Some(Ok(_)) => {}
                }
            }
        };
        tokio::time::timeout(wait, next).await.ok().flatten()
    }

    /// Challenge, accept the `connect` request, return it.
    pub async fn complete_handshake(&mut self) -> Value {
        self.challenge().await;
        let req = self.recv_json().await.expect("connect request");
        assert_eq!(req["method"], "connect");
        self.respond_ok(req["id"].as_str().unwrap(), json!({})).await;
        req
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
