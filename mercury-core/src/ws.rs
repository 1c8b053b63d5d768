//! WebSocket transport over tokio-tungstenite
//!
//! Each [`Connection::open`] spawns one task that performs the handshake and
//! then pumps frames in both directions until the socket ends. Calling `open`
//! again aborts the previous task first.
//!
//! Failures are reported as close details:
//! - handshake rejected: the HTTP status code
//! - I/O failure: the OS error code, or 0
//! - server close frame: its code and reason (1005 when it has none)
//! - socket ended without a close frame: no detail

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    error::ProtocolError,
    handshake::client::Request,
    http::{HeaderValue, header::AUTHORIZATION},
    protocol::{CloseFrame, frame::coding::CloseCode},
    Message, Utf8Bytes,
};

use crate::protocol::{CloseDetail, NO_STATUS_CODE, NORMAL_CLOSURE_CODE};
use crate::transport::{ConnectRequest, Connection, Connector, EventSink, TransportError};

/// Close code reported for protocol violations (RFC 6455 §7.4.1)
const PROTOCOL_ERROR_CODE: u16 = 1002;

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn create(&self, request: ConnectRequest, sink: EventSink) -> Box<dyn Connection> {
        Box::new(WsConnection::new(request, sink))
    }
}

pub struct WsConnection {
    request: ConnectRequest,
    sink: EventSink,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl WsConnection {
    pub fn new(request: ConnectRequest, sink: EventSink) -> Self {
        Self {
            request,
            sink,
            outbound: None,
            task: None,
        }
    }
}

impl Connection for WsConnection {
    fn open(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.task = Some(tokio::spawn(run_socket(
            self.request.clone(),
            self.sink.clone(),
            rx,
        )));
    }

    fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("client disconnect"),
            };
            let _ = tx.send(Message::Close(Some(frame)));
        }
    }

    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Build the handshake request with the bearer header attached
pub fn build_request(request: &ConnectRequest) -> Result<Request, TransportError> {
    let mut client_request = request.endpoint.as_str().into_client_request()?;
    let authorization = HeaderValue::from_str(&request.authorization())
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    client_request.headers_mut().insert(AUTHORIZATION, authorization);
    Ok(client_request)
}

async fn run_socket(
    request: ConnectRequest,
    sink: EventSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let client_request = match build_request(&request) {
        Ok(client_request) => client_request,
        Err(e) => {
            tracing::warn!(endpoint = %request.endpoint, error = %e, "invalid connect request");
            sink.closed(Some(CloseDetail::new(0, e.to_string())));
            return;
        }
    };

    // Voice/video framing wants small frames out immediately
    let stream = match tokio_tungstenite::connect_async_with_config(
        client_request,
        None,
        request.voice_video,
    )
    .await
    {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let detail = close_detail_for(&e);
            tracing::warn!(
                endpoint = %request.endpoint,
                code = detail.code,
                error = %e,
                "websocket handshake failed"
            );
            sink.closed(Some(detail));
            return;
        }
    };

    tracing::debug!(connection = sink.connection(), "websocket handshake complete");
    sink.opened();

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        tracing::warn!(error = %e, "websocket write failed");
                        sink.closed(Some(close_detail_for(&e)));
                        return;
                    }
                }
                None => {
                    // Connection handle dropped
                    let _ = write.close().await;
                    sink.closed(Some(CloseDetail::new(NORMAL_CLOSURE_CODE, "closed by client")));
                    return;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => sink.text(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => sink.text(text),
                    Err(_) => tracing::debug!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| CloseDetail::new(u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| CloseDetail::new(NO_STATUS_CODE, ""));
                    let _ = write.close().await;
                    sink.closed(Some(detail));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::Protocol(
                    ProtocolError::ResetWithoutClosingHandshake,
                )))
                | None => {
                    sink.closed(None);
                    return;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket read failed");
                    sink.closed(Some(close_detail_for(&e)));
                    return;
                }
            },
        }
    }
}

fn close_detail_for(error: &tungstenite::Error) -> CloseDetail {
    let code = match error {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        tungstenite::Error::Io(e) => e
            .raw_os_error()
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(0),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            NORMAL_CLOSURE_CODE
        }
        tungstenite::Error::Protocol(_) => PROTOCOL_ERROR_CODE,
        _ => 0,
    };
    CloseDetail::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(endpoint: &str) -> ConnectRequest {
        ConnectRequest {
            endpoint: endpoint.to_string(),
            bearer_token: "secret".to_string(),
            voice_video: true,
        }
    }

    #[test]
    fn test_build_request_sets_bearer_header() {
        let built = build_request(&request("wss://events.example.com/v1")).unwrap();
        assert_eq!(
            built.headers().get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Bearer secret"
        );
        assert_eq!(built.uri().host(), Some("events.example.com"));
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        assert!(build_request(&request("not a url")).is_err());
    }

    #[test]
    fn test_io_errors_map_to_recoverable_codes() {
        let refused = tungstenite::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        let detail = close_detail_for(&refused);
        assert_eq!(detail.code, 0);
        assert!(!detail.is_abnormal());

        let closed = close_detail_for(&tungstenite::Error::ConnectionClosed);
        assert_eq!(closed.code, NORMAL_CLOSURE_CODE);
    }

    #[test]
    fn test_send_before_open_fails() {
        let (sink, _rx) = EventSink::channel(1);
        let mut conn = WsConnection::new(request("ws://127.0.0.1:1"), sink);
        assert!(matches!(
            conn.send_text("x".to_string()),
            Err(TransportError::NotConnected)
        ));
        // close without open is a no-op
        conn.close();
    }
}
