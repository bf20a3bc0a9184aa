//! One real-time connection, from upgrade to teardown.
//!
//! `Connecting → Authenticated → Active → Disconnected`. Identity is checked
//! once, either at upgrade (bearer header or `?token=`) or from the first
//! `authenticate` frame, and never re-checked afterwards.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use palaver_shared::protocol::{ClientEvent, Command, ServerEvent};
use palaver_shared::{ChatError, UserId};

use crate::api::AppState;
use crate::auth::{bearer_token, TokenAuthority};
use crate::db::Db;
use crate::hub::ConnectionId;
use crate::rate_limit::TokenBucket;
use crate::router::{ConnectionCtx, EventRouter};

const RATE_LIMITED: &str = "Too many events, slow down";
const HANDSHAKE_TIMED_OUT: &str = "Authentication timed out";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Disconnected,
}

struct Phase {
    conn: ConnectionId,
    state: SessionState,
}

impl Phase {
    fn advance(&mut self, next: SessionState) {
        trace!(conn = %self.conn, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Runs connection teardown exactly once, however the session ends.
struct SessionGuard {
    router: EventRouter,
    ctx: ConnectionCtx,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.router.disconnect(self.ctx);
    }
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let credential = bearer_token(&headers)
        .map(str::to_owned)
        .or(query.token.filter(|t| !t.trim().is_empty()));

    let user = match credential {
        Some(token) => match authenticate(&state.tokens, &state.db, &token) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "rejected socket upgrade");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| run_session(socket, state, user))
}

/// Resolve a credential to an existing user.
pub fn authenticate(tokens: &TokenAuthority, db: &Db, token: &str) -> Result<UserId, ChatError> {
    let user = tokens.verify(token).map_err(|e| {
        trace!(error = %e, "token rejected");
        ChatError::Unauthorized
    })?;
    match db.with(|db| db.user_exists(&user)) {
        Ok(true) => Ok(user),
        Ok(false) => Err(ChatError::Unauthorized),
        Err(e) => {
            warn!(user = %user, error = %e, "identity lookup failed");
            Err(ChatError::Unauthorized)
        }
    }
}

async fn run_session(socket: WebSocket, state: AppState, preauthenticated: Option<UserId>) {
    let conn = ConnectionId::new();
    let mut phase = Phase {
        conn,
        state: SessionState::Connecting,
    };
    let (mut sink, mut stream) = socket.split();

    let user = match preauthenticated {
        Some(user) => user,
        None => {
            let timeout = state.config.handshake_timeout;
            match handshake(&mut stream, &state.tokens, &state.db, timeout).await {
                Ok(user) => user,
                Err(reason) => {
                    debug!(
                        conn = %conn,
                        reason = reason.as_deref().unwrap_or("closed"),
                        "handshake failed"
                    );
                    reject(&mut sink, reason).await;
                    return;
                }
            }
        }
    };
    phase.advance(SessionState::Authenticated);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let ctx = ConnectionCtx { conn, user };
    let router = state.router.clone();
    router.connect(ctx, tx);
    let _guard = SessionGuard {
        router: router.clone(),
        ctx,
    };
    phase.advance(SessionState::Active);
    info!(user = %user, conn = %conn, "session active");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.to_json() {
                Ok(json) => {
                    if sink.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(event = event.name(), error = %e, "failed to encode event"),
            }
        }
    });

    pump(
        &mut stream,
        &router,
        ctx,
        state.config.events_per_sec,
        state.config.event_burst,
    )
    .await;

    phase.advance(SessionState::Disconnected);
    send_task.abort();
    info!(user = %user, conn = %conn, "session closed");
}

/// Wait for the first text frame and authenticate it. `Err(None)` means the
/// peer went away; `Err(Some(text))` is reported before closing.
async fn handshake<S>(
    stream: &mut S,
    tokens: &TokenAuthority,
    db: &Db,
    limit: Duration,
) -> Result<UserId, Option<String>>
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let first = tokio::time::timeout(limit, first_text(stream))
        .await
        .map_err(|_| Some(HANDSHAKE_TIMED_OUT.to_string()))?
        .ok_or(None)?;

    let token = match ClientEvent::parse(&first).map(Command::try_from) {
        Ok(Ok(Command::Authenticate { token })) => token,
        _ => return Err(ChatError::Unauthorized.client_message()),
    };
    authenticate(tokens, db, &token).map_err(|e| e.client_message())
}

async fn first_text<S>(stream: &mut S) -> Option<String>
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Some(text),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Send the handshake failure, if any, then close.
async fn reject<S>(sink: &mut S, reason: Option<String>)
where
    S: Sink<WsMessage> + Unpin,
{
    if let Some(reason) = reason {
        if let Ok(json) = ServerEvent::error(reason).to_json() {
            let _ = sink.send(WsMessage::Text(json)).await;
        }
    }
    let _ = sink.close().await;
}

/// Feed inbound frames to the router until the peer goes away. Frames over
/// the connection's budget are dropped with an `errorMessage`.
async fn pump<S>(stream: &mut S, router: &EventRouter, ctx: ConnectionCtx, rate: f64, burst: f64)
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let mut bucket = TokenBucket::new(burst);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if !bucket.try_consume(rate, burst) {
                    debug!(user = %ctx.user, conn = %ctx.conn, "event rate exceeded");
                    router
                        .hub()
                        .emit_to_connection(ctx.conn, ServerEvent::error(RATE_LIMITED));
                    continue;
                }
                handle_frame(router, ctx, &text);
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %ctx.conn, error = %e, "socket error");
                break;
            }
        }
    }
}

/// Decode one inbound frame and hand it to the router.
fn handle_frame(router: &EventRouter, ctx: ConnectionCtx, frame: &str) {
    let event = match ClientEvent::parse(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn = %ctx.conn, error = %e, "dropping malformed frame");
            return;
        }
    };
    match Command::try_from(event) {
        Ok(command) => router.dispatch(ctx, command),
        Err(e) => router.report(ctx, e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream;
    use palaver_store::{Database, NewUser};

    use super::*;
    use crate::hub::Hub;
    use crate::presence::PresenceRegistry;

    fn setup() -> (EventRouter, Db, TokenAuthority) {
        let db = Db::new(Database::open_in_memory().unwrap());
        let router = EventRouter::new(
            db.clone(),
            Arc::new(Hub::new()),
            Arc::new(PresenceRegistry::new()),
        );
        let tokens = TokenAuthority::new([3u8; 32], Duration::from_secs(3600));
        (router, db, tokens)
    }

    fn create(db: &Db, name: &str) -> UserId {
        db.with(|db| {
            db.create_user(&NewUser {
                username: name.into(),
                ..Default::default()
            })
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_authenticate_known_user() {
        let (_router, db, tokens) = setup();
        let alice = create(&db, "alice");
        assert_eq!(authenticate(&tokens, &db, &tokens.issue(&alice)), Ok(alice));
    }

    #[test]
    fn test_authenticate_rejects_unknown_and_garbage() {
        let (_router, db, tokens) = setup();
        let ghost = UserId::new();
        assert_eq!(
            authenticate(&tokens, &db, &tokens.issue(&ghost)),
            Err(ChatError::Unauthorized)
        );
        assert_eq!(
            authenticate(&tokens, &db, "not-a-token"),
            Err(ChatError::Unauthorized)
        );
    }

    #[test]
    fn test_guard_drop_tears_down_presence() {
        let (router, db, _tokens) = setup();
        let alice = create(&db, "alice");
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = ConnectionCtx {
            conn: ConnectionId::new(),
            user: alice,
        };
        router.connect(ctx, tx);
        assert!(router.presence().is_online(&alice));

        let guard = SessionGuard {
            router: router.clone(),
            ctx,
        };
        drop(guard);

        assert!(!router.presence().is_online(&alice));
        assert_eq!(router.hub().connection_count(), 0);
        assert!(!db.with(|db| db.get_user(&alice)).unwrap().online);
    }

    #[test]
    fn test_guard_runs_on_panic() {
        let (router, db, _tokens) = setup();
        let alice = create(&db, "alice");
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = ConnectionCtx {
            conn: ConnectionId::new(),
            user: alice,
        };
        router.connect(ctx, tx);

        let inner = router.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = SessionGuard { router: inner, ctx };
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert!(!router.presence().is_online(&alice));
    }

    #[test]
    fn test_handle_frame_outcomes() {
        let (router, db, _tokens) = setup();
        let alice = create(&db, "alice");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ConnectionCtx {
            conn: ConnectionId::new(),
            user: alice,
        };
        router.connect(ctx, tx);
        while rx.try_recv().is_ok() {}

        // Malformed JSON and bad ids are dropped without a reply.
        handle_frame(&router, ctx, "{not json");
        handle_frame(&router, ctx, r#"{"event":"joinChat","data":{"otherUserId":"nope"}}"#);
        assert!(rx.try_recv().is_err());

        // Validation failures are reported once.
        let bob = create(&db, "bob");
        let frame = format!(r#"{{"event":"sendMessage","data":{{"to":"{bob}","text":"   "}}}}"#);
        handle_frame(&router, ctx, &frame);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::ErrorMessage { .. })));
        assert!(rx.try_recv().is_err());

        let frame = format!(r#"{{"event":"joinChat","data":{{"otherUserId":"{bob}"}}}}"#);
        handle_frame(&router, ctx, &frame);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::JoinedChat { .. })));
    }

    fn text(frame: String) -> Result<WsMessage, axum::Error> {
        Ok(WsMessage::Text(frame))
    }

    fn auth_frame(token: &str) -> String {
        format!(r#"{{"event":"authenticate","data":{{"token":"{token}"}}}}"#)
    }

    #[tokio::test]
    async fn test_handshake_accepts_authenticate_frame() {
        let (_router, db, tokens) = setup();
        let alice = create(&db, "alice");
        let mut frames = stream::iter(vec![
            Ok(WsMessage::Ping(vec![1])),
            text(auth_frame(&tokens.issue(&alice))),
        ]);

        let user = handshake(&mut frames, &tokens, &db, Duration::from_secs(10)).await;
        assert_eq!(user, Ok(alice));
    }

    #[tokio::test]
    async fn test_bad_handshake_sends_one_error_then_closes() {
        let (_router, db, tokens) = setup();
        let mut frames = stream::iter(vec![text(auth_frame("v1.forged"))]);
        let reason = handshake(&mut frames, &tokens, &db, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(reason.is_some());

        let (mut sink, outbound) = futures::channel::mpsc::unbounded::<WsMessage>();
        reject(&mut sink, reason).await;
        let sent: Vec<WsMessage> = outbound.collect().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            WsMessage::Text(json) => assert!(json.contains(r#""event":"errorMessage""#)),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_requires_authenticate_first() {
        let (_router, db, tokens) = setup();
        let bob = create(&db, "bob");
        let frame = format!(r#"{{"event":"joinChat","data":{{"otherUserId":"{bob}"}}}}"#);
        let mut frames = stream::iter(vec![text(frame)]);
        let result = handshake(&mut frames, &tokens, &db, Duration::from_secs(10)).await;
        assert_eq!(result, Err(ChatError::Unauthorized.client_message()));
    }

    #[tokio::test]
    async fn test_handshake_peer_gone() {
        let (_router, db, tokens) = setup();
        let mut frames = stream::iter(vec![Ok(WsMessage::Close(None))]);
        let result = handshake(&mut frames, &tokens, &db, Duration::from_secs(10)).await;
        assert_eq!(result, Err(None));

        // Nothing to report, but the socket is still closed.
        let (mut sink, outbound) = futures::channel::mpsc::unbounded::<WsMessage>();
        reject(&mut sink, None).await;
        assert!(outbound.collect::<Vec<_>>().await.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        tokio::time::pause();
        let (_router, db, tokens) = setup();
        let mut silent = stream::pending::<Result<WsMessage, axum::Error>>();
        let result = handshake(&mut silent, &tokens, &db, Duration::from_secs(5)).await;
        assert_eq!(result, Err(Some(HANDSHAKE_TIMED_OUT.to_string())));
    }

    #[tokio::test]
    async fn test_pump_drops_frames_over_budget() {
        let (router, db, _tokens) = setup();
        let alice = create(&db, "alice");
        let bob = create(&db, "bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ConnectionCtx {
            conn: ConnectionId::new(),
            user: alice,
        };
        router.connect(ctx, tx);
        while rx.try_recv().is_ok() {}

        let typing = format!(r#"{{"event":"typing","data":{{"otherUserId":"{bob}"}}}}"#);
        let mut frames = stream::iter((0..5).map(|_| text(typing.clone())));
        pump(&mut frames, &router, ctx, 1.0, 2.0).await;

        let mut limited = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ServerEvent::ErrorMessage { message } => {
                    assert_eq!(message, RATE_LIMITED);
                    limited += 1;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(limited, 3);
    }
}
