//! TCP listeners for the call and event channels
//!
//! One task per local connection. Requests on a call connection are each
//! handled on their own task, so a slow call never holds up the others;
//! responses go back through a per-connection writer task. Event requests
//! are handled in order so acks keep request order. A malformed or
//! oversized line gets a protocol error reply and the connection stays open.

use super::fanout::{LocalConnId, SubscriptionBroker};
use super::protocol::{
    encode_line, is_blank, parse_call_request, parse_event_request, read_frame, CallResponse,
    EventReply, EventRequest, Frame, MAX_FRAME_BYTES,
};
use crate::core::types::ChannelKey;
use crate::monitoring::MetricsRegistry;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Listen addresses for the two local transports
#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    pub call_addr: SocketAddr,
    pub event_addr: SocketAddr,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            call_addr: SocketAddr::from(([127, 0, 0, 1], 7401)),
            event_addr: SocketAddr::from(([127, 0, 0, 1], 7402)),
        }
    }
}

/// Serves the broker over local TCP
pub struct BrokerServer {
    broker: SubscriptionBroker,
    metrics: Option<MetricsRegistry>,
}

#[derive(Clone, Copy)]
enum Transport {
    Call,
    Event,
}

impl Transport {
    fn as_str(&self) -> &'static str {
        match self {
            Transport::Call => "call",
            Transport::Event => "event",
        }
    }
}

impl BrokerServer {
    pub fn new(broker: SubscriptionBroker, metrics: Option<MetricsRegistry>) -> Self {
        Self { broker, metrics }
    }

    /// Bind both listeners and serve until `shutdown` flips to true
    pub async fn serve(
        self,
        config: BrokerServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let call = TcpListener::bind(config.call_addr)
            .await
            .with_context(|| format!("failed to bind call channel on {}", config.call_addr))?;
        let event = TcpListener::bind(config.event_addr)
            .await
            .with_context(|| format!("failed to bind event channel on {}", config.event_addr))?;
        self.serve_on(call, event, shutdown).await
    }

    /// Serve on already bound listeners
    pub async fn serve_on(
        self,
        call: TcpListener,
        event: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            call = %call.local_addr().context("call listener has no address")?,
            event = %event.local_addr().context("event listener has no address")?,
            "broker listening"
        );

        let server = Arc::new(self);
        let calls = tokio::spawn(accept_loop(
            server.clone(),
            call,
            Transport::Call,
            shutdown.clone(),
        ));
        let events = tokio::spawn(accept_loop(server, event, Transport::Event, shutdown));

        let (calls, events) = tokio::join!(calls, events);
        calls.context("call accept loop panicked")?;
        events.context("event accept loop panicked")?;
        info!("broker stopped");
        Ok(())
    }

    fn connection_gauge(&self, transport: Transport, delta: i64) {
        if let Some(metrics) = &self.metrics {
            metrics
                .broker()
                .local_connections
                .with_label_values(&[transport.as_str()])
                .add(delta);
        }
    }

    fn malformed(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.broker().malformed_frames_total.inc();
        }
    }
}

async fn accept_loop(
    server: Arc<BrokerServer>,
    listener: TcpListener,
    transport: Transport,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(transport = transport.as_str(), "accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => return,
        };

        let server = server.clone();
        tokio::spawn(async move {
            debug!(transport = transport.as_str(), %peer, "local client connected");
            server.connection_gauge(transport, 1);
            match transport {
                Transport::Call => handle_call_connection(&server, stream).await,
                Transport::Event => handle_event_connection(&server, stream).await,
            }
            server.connection_gauge(transport, -1);
            debug!(transport = transport.as_str(), %peer, "local client disconnected");
        });
    }
}

/// Writer task draining `rx` into the socket
fn spawn_writer<T>(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<T>,
) -> tokio::task::JoinHandle<()>
where
    T: AsRef<str> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write.write_all(line.as_ref().as_bytes()).await {
                debug!("local write failed: {}", e);
                break;
            }
        }
        let _ = write.shutdown().await;
    })
}

fn send_frame<T: Serialize, S: From<String>>(tx: &mpsc::UnboundedSender<S>, frame: &T) {
    match encode_line(frame) {
        Ok(line) => {
            // Receiver gone means the client left
            let _ = tx.send(S::from(line));
        }
        Err(e) => error!("failed to encode frame: {}", e),
    }
}

async fn handle_call_connection(server: &Arc<BrokerServer>, stream: TcpStream) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = spawn_writer(write, rx);

    let mut reader = BufReader::new(read);
    loop {
        let line = match read_frame(&mut reader, MAX_FRAME_BYTES).await {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::TooLong) => {
                server.malformed();
                send_frame(&tx, &CallResponse::err(Value::Null, &Frame::too_long_error()));
                continue;
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                debug!("call channel read failed: {}", e);
                break;
            }
        };
        if is_blank(&line) {
            continue;
        }

        match parse_call_request(&line) {
            Ok(request) => {
                let broker = server.broker.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = broker.call(request).await;
                    send_frame(&tx, &response);
                });
            }
            Err(response) => {
                server.malformed();
                send_frame(&tx, &response);
            }
        }
    }

    // In-flight calls hold their own sender; the writer ends after the last one
    drop(tx);
    let _ = writer.await;
}

async fn handle_event_connection(server: &Arc<BrokerServer>, stream: TcpStream) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Arc<str>>();
    let conn = server.broker.register(tx.clone());
    let writer = spawn_writer(write, rx);

    let mut reader = BufReader::new(read);
    loop {
        let reply = match read_frame(&mut reader, MAX_FRAME_BYTES).await {
            Ok(Frame::Line(line)) if is_blank(&line) => continue,
            Ok(Frame::Line(line)) => match parse_event_request(&line) {
                Ok(request) => handle_event_request(&server.broker, conn, request).await,
                Err(reply) => {
                    server.malformed();
                    reply
                }
            },
            Ok(Frame::TooLong) => {
                server.malformed();
                EventReply::error(None, &Frame::too_long_error())
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                debug!(conn = %conn, "event channel read failed: {}", e);
                break;
            }
        };
        send_frame(&tx, &reply);
    }

    server.broker.disconnect(conn).await;
    drop(tx);
    let _ = writer.await;
}

async fn handle_event_request(
    broker: &SubscriptionBroker,
    conn: LocalConnId,
    request: EventRequest,
) -> EventReply {
    match request {
        EventRequest::Subscribe { channel, .. } => {
            let result = match ChannelKey::parse(&channel) {
                Ok(key) => broker.subscribe(conn, key).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => EventReply::Subscribed { channel },
                Err(e) => {
                    debug!(conn = %conn, channel = %channel, error = %e, "subscribe refused");
                    EventReply::error(Some(channel), &e)
                }
            }
        }
        EventRequest::Unsubscribe { channel, .. } => match ChannelKey::parse(&channel) {
            Ok(key) => {
                broker.unsubscribe(conn, &key).await;
                EventReply::Unsubscribed { channel }
            }
            Err(e) => EventReply::error(Some(channel), &e),
        },
    }
}
