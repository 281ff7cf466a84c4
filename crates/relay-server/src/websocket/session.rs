//! Connection session lifecycle: one read loop and one write loop per
//! connected client, from upgrade through teardown.
//!
//! The read loop runs on the caller's task; the write loop is spawned. They
//! share the connection's close token. Whichever loop ends first tears the
//! session down (unregister, then close), which wakes the other one.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use relay_core::{CallContext, Event, UserId};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use super::connection::ClientConnection;
use super::frame::Frame;
use super::hub::Hub;
use super::router::EventRouter;
use crate::config::SessionConfig;
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DECODE_ERRORS_TOTAL, DISCONNECTIONS_TOTAL,
    ROUTE_ERRORS_TOTAL,
};

/// How long the write loop waits to deliver a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Everything a session needs from its instance.
#[derive(Clone)]
pub struct SessionDeps {
    /// Registry the session attaches to.
    pub hub: Arc<Hub>,
    /// Router for inbound events.
    pub router: Arc<EventRouter>,
    /// Timing and queueing.
    pub config: SessionConfig,
    /// Deadline for directory and broker calls.
    pub call_timeout: Duration,
    /// Instance shutdown token. Each session's close token is a child of it.
    pub shutdown: CancellationToken,
}

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadExit {
    /// The session was closed from outside (write failure, displacement,
    /// overflow disconnect, shutdown).
    Closed,
    /// The client sent a close frame.
    ClientClosed,
    /// The transport stream ended.
    Eof,
    /// Nothing arrived within the read deadline.
    DeadlineExpired,
    /// The transport reported an error.
    ReadFailed,
    /// Routing an event failed.
    RouteFailed,
}

impl ReadExit {
    /// Short label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::ClientClosed => "client_closed",
            Self::Eof => "eof",
            Self::DeadlineExpired => "deadline_expired",
            Self::ReadFailed => "read_failed",
            Self::RouteFailed => "route_failed",
        }
    }
}

/// Why the write loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteExit {
    /// The session was closed; a close frame was attempted.
    Closed,
    /// The transport rejected a frame.
    WriteFailed,
}

/// Run a session for `user_id` over a split transport.
///
/// Returns once both loops have ended and the session is unregistered.
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn run_session<S, E, K>(stream: S, sink: K, user_id: UserId, deps: SessionDeps) -> ReadExit
where
    S: Stream<Item = Result<Frame, E>> + Send + Unpin,
    E: Display + Send,
    K: Sink<Frame> + Send + Unpin + 'static,
    K::Error: Display + Send,
{
    let close = deps.shutdown.child_token();
    let (conn, rx) = ClientConnection::channel(
        user_id,
        deps.config.queue_capacity,
        deps.config.overflow_policy,
        close.clone(),
    );
    let ctx = CallContext::new(deps.call_timeout, close);

    let started = Instant::now();
    info!(conn_id = %conn.id, "client connected");
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);

    deps.hub.register(conn.clone(), &ctx).await;

    let writer = tokio::spawn(
        write_loop(
            sink,
            rx,
            conn.clone(),
            deps.config.ping_interval,
            deps.hub.clone(),
            deps.call_timeout,
        )
        .in_current_span(),
    );

    let exit = read_loop(stream, &conn, &deps.router, deps.config.read_timeout, &ctx).await;
    teardown(&conn, &deps.hub, deps.call_timeout).await;

    match writer.await {
        Ok(write_exit) => debug!(?write_exit, "write loop joined"),
        Err(e) => warn!(error = %e, "write loop task failed"),
    }

    info!(
        reason = exit.as_str(),
        duration_secs = started.elapsed().as_secs_f64(),
        dropped = conn.drop_count(),
        "client disconnected"
    );
    counter!(DISCONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    exit
}

async fn read_loop<S, E>(
    mut stream: S,
    conn: &ClientConnection,
    router: &EventRouter,
    read_timeout: Duration,
    ctx: &CallContext,
) -> ReadExit
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            () = conn.closed() => return ReadExit::Closed,
            // Restarts per frame, so keepalives extend it too
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!(timeout = ?read_timeout, "read deadline expired");
                return ReadExit::DeadlineExpired;
            }
            Ok(None) => return ReadExit::Eof,
            Ok(Some(Err(e))) => {
                warn!(error = %e, "read failed");
                return ReadExit::ReadFailed;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match frame {
            Frame::Text(text) => Event::decode(&text),
            Frame::Binary(bytes) => Event::decode_bytes(&bytes),
            Frame::Ping(_) | Frame::Pong(_) => continue,
            Frame::Close => {
                debug!("client sent close frame");
                return ReadExit::ClientClosed;
            }
        };
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                counter!(DECODE_ERRORS_TOTAL).increment(1);
                continue;
            }
        };

        match router.route(&event, conn, ctx).await {
            Ok(delivery) => debug!(to = %event.to, ?delivery, "event routed"),
            Err(e) => {
                counter!(ROUTE_ERRORS_TOTAL, "kind" => e.kind()).increment(1);
                if e.is_protocol_violation() {
                    warn!(error = %e, "protocol violation, closing session");
                } else {
                    error!(error = %e, "routing failed, closing session");
                }
                return ReadExit::RouteFailed;
            }
        }
    }
}

async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::Receiver<String>,
    conn: Arc<ClientConnection>,
    ping_interval: Duration,
    hub: Arc<Hub>,
    call_timeout: Duration,
) -> WriteExit
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    let exit = loop {
        let frame = tokio::select! {
            biased;
            () = conn.closed() => None,
            msg = rx.recv() => msg.map(Frame::Text),
            _ = ping.tick() => Some(Frame::Ping(Bytes::new())),
        };
        let Some(frame) = frame else {
            send_close(&mut sink).await;
            break WriteExit::Closed;
        };

        let sent = tokio::select! {
            biased;
            () = conn.closed() => None,
            res = sink.send(frame) => Some(res),
        };
        match sent {
            None => {
                send_close(&mut sink).await;
                break WriteExit::Closed;
            }
            Some(Err(e)) => {
                warn!(error = %e, "write failed");
                break WriteExit::WriteFailed;
            }
            Some(Ok(())) => {}
        }
    };

    debug!(?exit, "write loop ended");
    teardown(&conn, &hub, call_timeout).await;
    exit
}

async fn send_close<K>(sink: &mut K)
where
    K: Sink<Frame> + Unpin,
{
    if tokio::time::timeout(CLOSE_GRACE, sink.send(Frame::Close))
        .await
        .is_err()
    {
        debug!("close frame not delivered within grace period");
    }
}

/// Unregister then close, exactly once per session no matter which loop
/// gets here first.
async fn teardown(conn: &Arc<ClientConnection>, hub: &Hub, call_timeout: Duration) {
    if conn.begin_teardown() {
        // The session token may already be cancelled, so the directory
        // delete runs under its own deadline.
        let ctx = CallContext::with_timeout(call_timeout);
        let _ = hub.release(conn, &ctx).await;
    }
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::channel::mpsc as fmpsc;
    use relay_cluster::{Broker, MemoryBroker, MemoryDirectory, PresenceDirectory};
    use relay_settings::OverflowPolicy;
    use tokio::task::JoinHandle;

    struct Env {
        deps: SessionDeps,
        dir: Arc<MemoryDirectory>,
        broker: Arc<MemoryBroker>,
    }

    fn env(config: SessionConfig) -> Env {
        let dir = Arc::new(MemoryDirectory::new());
        let broker = Arc::new(MemoryBroker::new());
        let hub = Arc::new(Hub::new("S1".into(), dir.clone()));
        let router = Arc::new(EventRouter::new(hub.clone(), dir.clone(), broker.clone()));
        Env {
            deps: SessionDeps {
                hub,
                router,
                config,
                call_timeout: Duration::from_secs(1),
                shutdown: CancellationToken::new(),
            },
            dir,
            broker,
        }
    }

    struct TestClient {
        inbound: fmpsc::UnboundedSender<Result<Frame, std::io::Error>>,
        outbound: fmpsc::UnboundedReceiver<Frame>,
        task: JoinHandle<ReadExit>,
    }

    impl TestClient {
        fn send_raw(&self, frame: Frame) {
            self.inbound.unbounded_send(Ok(frame)).unwrap();
        }

        fn send_event(&self, event: &Event) {
            self.send_raw(Frame::Text(serde_json::to_string(event).unwrap()));
        }

        /// Next text frame, skipping keepalive pings.
        async fn next_text(&mut self) -> String {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(30), self.outbound.next())
                    .await
                    .expect("timed out waiting for frame");
                match frame {
                    Some(Frame::Text(t)) => return t,
                    Some(Frame::Ping(_)) => {}
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        }

        /// Drain outbound frames until the close frame (or end of stream).
        async fn expect_close(&mut self) {
            loop {
                match self.outbound.next().await {
                    Some(Frame::Close) | None => return,
                    Some(_) => {}
                }
            }
        }
    }

    fn connect(deps: &SessionDeps, user: &str) -> TestClient {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let task = tokio::spawn(run_session(in_rx, out_tx, user.into(), deps.clone()));
        TestClient {
            inbound: in_tx,
            outbound: out_rx,
            task,
        }
    }

    async fn until(cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    async fn connected(deps: &SessionDeps, user: &str) -> TestClient {
        let client = connect(deps, user);
        let id = UserId::from(user);
        until(|| deps.hub.lookup(&id).is_some()).await;
        client
    }

    #[tokio::test]
    async fn local_delivery_between_sessions() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        let mut b = connected(&e.deps, "B").await;

        a.send_event(&Event::send_message("A", "B", "hi"));
        assert_eq!(b.next_text().await, "hi");
        assert_eq!(e.dir.lookup(&"B".into()).await.unwrap(), Some("S1".into()));
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        let mut b = connected(&e.deps, "B").await;

        for i in 0..10 {
            a.send_event(&Event::send_message("A", "B", format!("m{i}")));
        }
        for i in 0..10 {
            assert_eq!(b.next_text().await, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn remote_delivery_publishes_to_owner() {
        let e = env(SessionConfig::default());
        e.dir.set(&"C".into(), &"S2".into()).await.unwrap();
        let mut s2 = e.broker.subscribe("S2").await.unwrap();
        let a = connected(&e.deps, "A").await;

        a.send_event(&Event::send_message("A", "C", "far"));
        let raw = s2.next().await.unwrap();
        assert_eq!(raw, r#"{"to":"C","message":"far"}"#);
        assert!(e.deps.hub.lookup(&"C".into()).is_none());
    }

    #[tokio::test]
    async fn undecodable_frames_keep_session_open() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        let mut b = connected(&e.deps, "B").await;

        a.send_raw(Frame::Text("not json".into()));
        a.send_raw(Frame::Binary(Bytes::from_static(&[0xff, 0xfe])));
        a.send_raw(Frame::Binary(Bytes::from(
            serde_json::to_vec(&Event::send_message("A", "B", "via binary")).unwrap(),
        )));
        a.send_event(&Event::send_message("A", "B", "via text"));

        assert_eq!(b.next_text().await, "via binary");
        assert_eq!(b.next_text().await, "via text");
        assert!(!a.task.is_finished());
    }

    #[tokio::test]
    async fn unknown_type_terminates_only_the_sender() {
        let e = env(SessionConfig::default());
        let mut a = connected(&e.deps, "A").await;
        let mut b = connected(&e.deps, "B").await;
        let c = connected(&e.deps, "C").await;

        a.send_raw(Frame::Text(
            r#"{"type":"bogus","from":"A","to":"B","payload":"x"}"#.into(),
        ));
        a.expect_close().await;
        assert_eq!(a.task.await.unwrap(), ReadExit::RouteFailed);

        assert!(e.deps.hub.lookup(&"A".into()).is_none());
        assert!(e.dir.lookup(&"A".into()).await.unwrap().is_none());

        c.send_event(&Event::send_message("C", "B", "still here"));
        assert_eq!(b.next_text().await, "still here");
    }

    #[tokio::test]
    async fn directory_miss_ends_session() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;

        a.send_event(&Event::send_message("A", "nobody", "x"));
        assert_eq!(a.task.await.unwrap(), ReadExit::RouteFailed);
        assert!(e.deps.hub.is_empty());
    }

    #[tokio::test]
    async fn self_pointing_presence_does_not_end_sender() {
        let e = env(SessionConfig::default());
        e.dir.set(&"B".into(), &"S1".into()).await.unwrap();
        let mut s1 = e.broker.subscribe("S1").await.unwrap();
        let a = connected(&e.deps, "A").await;
        let mut c = connected(&e.deps, "C").await;

        a.send_event(&Event::send_message("A", "B", "hi"));
        assert_eq!(s1.next().await.unwrap(), r#"{"to":"B","message":"hi"}"#);

        a.send_event(&Event::send_message("A", "C", "still connected"));
        assert_eq!(c.next_text().await, "still connected");
        assert!(!a.task.is_finished());
        assert!(e.deps.hub.lookup(&"A".into()).is_some());
    }

    #[tokio::test]
    async fn full_recipient_queue_stalls_sender_until_drained() {
        let config = SessionConfig {
            queue_capacity: 1,
            ..SessionConfig::default()
        };
        let e = env(config);
        let a = connected(&e.deps, "A").await;
        let mut c = connected(&e.deps, "C").await;

        // B's transport holds one frame and then stalls until read
        let (_b_in_tx, b_in_rx) = fmpsc::unbounded::<Result<Frame, std::io::Error>>();
        let (b_out_tx, mut b_out_rx) = fmpsc::channel::<Frame>(0);
        let b_task = tokio::spawn(run_session(b_in_rx, b_out_tx, "B".into(), e.deps.clone()));
        until(|| e.deps.hub.lookup(&"B".into()).is_some()).await;

        for i in 0..4 {
            a.send_event(&Event::send_message("A", "B", format!("m{i}")));
        }
        a.send_event(&Event::send_message("A", "C", "after"));

        // A is parked on B's full queue, so its next event is not routed
        let early = tokio::time::timeout(Duration::from_millis(100), c.outbound.next()).await;
        assert!(early.is_err());
        assert!(!a.task.is_finished());
        assert!(!b_task.is_finished());

        let mut received = Vec::new();
        while received.len() < 4 {
            match b_out_rx.next().await.unwrap() {
                Frame::Text(t) => received.push(t),
                Frame::Ping(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(received, ["m0", "m1", "m2", "m3"]);
        assert_eq!(c.next_text().await, "after");
    }

    #[tokio::test]
    async fn client_close_frame_ends_session() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        a.send_raw(Frame::Close);
        assert_eq!(a.task.await.unwrap(), ReadExit::ClientClosed);
        assert!(e.deps.hub.is_empty());
        assert!(e.dir.is_empty());
    }

    #[tokio::test]
    async fn transport_error_ends_session() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        a.inbound
            .unbounded_send(Err(std::io::Error::other("reset")))
            .unwrap();
        assert_eq!(a.task.await.unwrap(), ReadExit::ReadFailed);
        assert!(e.deps.hub.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_expires_and_is_removed() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;

        let exit = a.task.await.unwrap();
        assert_eq!(exit, ReadExit::DeadlineExpired);
        assert!(e.deps.hub.is_empty());
        assert!(e.dir.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_extend_read_deadline() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;

        // 30s of activity against a 10s deadline
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            a.send_raw(Frame::Pong(Bytes::new()));
        }
        assert!(!a.task.is_finished());
        assert!(e.deps.hub.lookup(&"A".into()).is_some());

        assert_eq!(a.task.await.unwrap(), ReadExit::DeadlineExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_sends_pings() {
        let e = env(SessionConfig::default());
        let mut a = connected(&e.deps, "A").await;

        let first = a.outbound.next().await.unwrap();
        assert!(matches!(first, Frame::Ping(_)));
    }

    #[tokio::test]
    async fn write_failure_tears_down_session() {
        let e = env(SessionConfig::default());
        let a = connected(&e.deps, "A").await;
        let b = connected(&e.deps, "B").await;

        let TestClient {
            inbound: _b_inbound,
            outbound,
            task: b_task,
        } = b;
        drop(outbound);

        a.send_event(&Event::send_message("A", "B", "into the void"));
        assert_eq!(b_task.await.unwrap(), ReadExit::Closed);
        assert!(e.deps.hub.lookup(&"B".into()).is_none());
        assert!(e.deps.hub.lookup(&"A".into()).is_some());
    }

    #[tokio::test]
    async fn reconnect_displaces_previous_session() {
        let e = env(SessionConfig::default());
        let mut first = connected(&e.deps, "A").await;
        let first_conn = e.deps.hub.lookup(&"A".into()).unwrap();

        let mut second = connect(&e.deps, "A");
        until(|| {
            e.deps
                .hub
                .lookup(&"A".into())
                .is_some_and(|c| !Arc::ptr_eq(&c, &first_conn))
        })
        .await;

        first.expect_close().await;
        assert_eq!(first.task.await.unwrap(), ReadExit::Closed);

        // The displaced session's teardown left the new registration alone
        assert_eq!(e.deps.hub.len(), 1);
        assert_eq!(e.dir.lookup(&"A".into()).await.unwrap(), Some("S1".into()));

        let b = connected(&e.deps, "B").await;
        b.send_event(&Event::send_message("B", "A", "to the new one"));
        assert_eq!(second.next_text().await, "to the new one");
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let e = env(SessionConfig::default());
        let mut a = connected(&e.deps, "A").await;
        let mut b = connected(&e.deps, "B").await;

        e.deps.shutdown.cancel();
        a.expect_close().await;
        b.expect_close().await;
        assert_eq!(a.task.await.unwrap(), ReadExit::Closed);
        assert_eq!(b.task.await.unwrap(), ReadExit::Closed);
        assert!(e.deps.hub.is_empty());
        assert!(e.dir.is_empty());
    }

    #[tokio::test]
    async fn concurrent_connect_disconnect_is_symmetric() {
        let e = env(SessionConfig::default());
        let mut clients = Vec::new();
        for i in 0..20 {
            clients.push(connect(&e.deps, &format!("user-{i}")));
        }
        until(|| e.deps.hub.len() == 20).await;

        let mut closing = Vec::new();
        let mut open = Vec::new();
        for (i, client) in clients.into_iter().enumerate() {
            if i % 2 == 0 {
                drop(client.inbound);
                closing.push(client.task);
            } else {
                open.push(client);
            }
        }
        for task in closing {
            assert_eq!(task.await.unwrap(), ReadExit::Eof);
        }

        assert_eq!(e.deps.hub.len(), open.len());
        assert_eq!(e.dir.len(), open.len());
    }

    #[tokio::test]
    async fn slow_consumer_disconnected_under_disconnect_policy() {
        let config = SessionConfig {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::Disconnect,
            ..SessionConfig::default()
        };
        let e = env(config);
        let a = connected(&e.deps, "A").await;

        // B's transport accepts one frame and then stalls
        let (b_in_tx, b_in_rx) = fmpsc::unbounded::<Result<Frame, std::io::Error>>();
        let (b_out_tx, _b_out_rx) = fmpsc::channel::<Frame>(0);
        let b_task = tokio::spawn(run_session(b_in_rx, b_out_tx, "B".into(), e.deps.clone()));
        until(|| e.deps.hub.lookup(&"B".into()).is_some()).await;

        for i in 0..5 {
            a.send_event(&Event::send_message("A", "B", format!("m{i}")));
        }

        assert_eq!(b_task.await.unwrap(), ReadExit::Closed);
        drop(b_in_tx);
        assert!(e.deps.hub.lookup(&"B".into()).is_none());
        assert!(e.deps.hub.lookup(&"A".into()).is_some());
    }
}
