//! The WebSocket upgrade pipeline and session supervisor
//!
//! Upgrades share the HTTP pipeline prefix (source, access, route
//! lookup, authentication, connection rate limit) and terminate in an
//! authorization to connect upstream rather than a forwarded request.
//! An authorized upgrade yields a [`WebSocketSession`] that supervises
//! the two peer connections: idle and lifetime timers, optional pings,
//! per-message rate limiting, and symmetric close propagation.

use bytes::Bytes;
use http::Uri;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::outcome::GatewayOutcome;
use super::{GatewayCore, GatewayRequest};
use crate::auth::{AussieToken, RouteAuthResult};
use crate::config::WebSocketConfig;
use crate::error::Result;
use crate::ratelimit::{EffectiveRateLimit, RateLimitKey, RateLimitKind, RateLimiter};
use crate::registry::{normalize_path, EndpointType, RouteLookup};

/// Close 1000: orderly shutdown, idle timeout, or lifetime cap
pub const CLOSE_NORMAL: u16 = 1000;
/// Close 1001: a peer is going away (cancellation, upstream loss)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close 1002: protocol error, used for ping timeouts
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close 1011: unexpected relay failure
pub const CLOSE_UNEXPECTED: u16 = 1011;
/// Close 4429: the per-message rate limit was exceeded
pub const CLOSE_RATE_LIMITED: u16 = 4429;

/// One relayed WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// One side of a relayed session
///
/// The wire adapter implements this over its actual socket library;
/// tests implement it over channels.
#[async_trait::async_trait]
pub trait MessagePeer: Send {
    /// Next message, or `None` once the peer is gone
    async fn recv(&mut self) -> Option<WsMessage>;

    /// Send a message to the peer
    async fn send(&mut self, message: WsMessage) -> Result<()>;

    /// Close the peer connection with a code and reason
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClose {
    pub code: u16,
    pub reason: String,
}

/// The outcome of a WebSocket upgrade attempt
pub enum WebSocketUpgradeResult {
    /// Connect upstream and relay through the session
    Authorized {
        /// The backend URI with `ws`/`wss` scheme
        backend_uri: Uri,
        /// Re-issued identity to present upstream, when authenticated
        token: Option<AussieToken>,
        /// The supervisor for the upgraded session
        session: WebSocketSession,
    },

    /// The matched endpoint is not a WebSocket endpoint
    NotWebSocket,

    /// This instance is at its concurrent-session cap
    CapacityExceeded,

    /// Refused by a pipeline gate
    Refused(GatewayOutcome),
}

/// Releases one connection slot when dropped
struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Supervises one upgraded session
pub struct WebSocketSession {
    config: WebSocketConfig,
    limiter: Arc<dyn RateLimiter>,
    message_key: RateLimitKey,
    message_limit: EffectiveRateLimit,
    limiter_fail_open: bool,
    connection_id: String,
    _permit: ConnectionPermit,
}

impl WebSocketSession {
    /// The unique ID assigned to this session
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Relay between the client and backend peers until one side ends
    ///
    /// Contracts: either peer closing closes the other with a matching
    /// reason; idle and lifetime timers close with 1000; an unanswered
    /// ping closes with 1002; exceeding the per-message limit closes
    /// with 4429. The per-connection message bucket is dropped on the
    /// way out.
    pub async fn relay<C, B>(
        self,
        mut client: C,
        mut backend: B,
        cancel: &CancellationToken,
    ) -> SessionClose
    where
        C: MessagePeer,
        B: MessagePeer,
    {
        let started = Instant::now();
        let lifetime_deadline = started + self.config.max_lifetime.duration();
        let mut idle_deadline = started + self.config.idle_timeout.duration();
        let mut next_ping = self
            .config
            .ping_enabled()
            .then(|| started + self.config.ping_interval.duration());
        let mut pong_deadline: Option<Instant> = None;

        // A disabled timer needs some deadline to hand the select arm;
        // its guard keeps it from ever firing
        let never = lifetime_deadline + Duration::from_secs(1);

        let close = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break SessionClose { code: CLOSE_GOING_AWAY, reason: "going away".to_string() };
                }

                _ = sleep_until(lifetime_deadline) => {
                    break SessionClose { code: CLOSE_NORMAL, reason: "lifetime".to_string() };
                }

                _ = sleep_until(idle_deadline) => {
                    break SessionClose { code: CLOSE_NORMAL, reason: "idle".to_string() };
                }

                _ = sleep_until(pong_deadline.unwrap_or(never)), if pong_deadline.is_some() => {
                    break SessionClose { code: CLOSE_PROTOCOL_ERROR, reason: "ping timeout".to_string() };
                }

                _ = sleep_until(next_ping.unwrap_or(never)), if next_ping.is_some() && pong_deadline.is_none() => {
                    if client.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break SessionClose { code: CLOSE_UNEXPECTED, reason: "ping send failed".to_string() };
                    }
                    pong_deadline = Some(Instant::now() + self.config.ping_timeout.duration());
                    next_ping = Some(Instant::now() + self.config.ping_interval.duration());
                }

                message = client.recv() => {
                    idle_deadline = Instant::now() + self.config.idle_timeout.duration();
                    match message {
                        None => {
                            break SessionClose { code: CLOSE_NORMAL, reason: "client disconnected".to_string() };
                        }
                        Some(WsMessage::Close { code, reason }) => {
                            break SessionClose { code, reason };
                        }
                        Some(WsMessage::Pong(_)) => {
                            pong_deadline = None;
                        }
                        Some(WsMessage::Ping(payload)) => {
                            let _ = client.send(WsMessage::Pong(payload)).await;
                        }
                        Some(message) => {
                            if let Some(close) = self.account_message().await {
                                break close;
                            }
                            if backend.send(message).await.is_err() {
                                break SessionClose { code: CLOSE_UNEXPECTED, reason: "backend send failed".to_string() };
                            }
                        }
                    }
                }

                message = backend.recv() => {
                    idle_deadline = Instant::now() + self.config.idle_timeout.duration();
                    match message {
                        None => {
                            break SessionClose { code: CLOSE_GOING_AWAY, reason: "backend disconnected".to_string() };
                        }
                        Some(WsMessage::Close { code, reason }) => {
                            break SessionClose { code, reason };
                        }
                        Some(WsMessage::Ping(payload)) => {
                            let _ = backend.send(WsMessage::Pong(payload)).await;
                        }
                        Some(WsMessage::Pong(_)) => {}
                        Some(message) => {
                            if client.send(message).await.is_err() {
                                break SessionClose { code: CLOSE_UNEXPECTED, reason: "client send failed".to_string() };
                            }
                        }
                    }
                }
            }
        };

        // Both peers learn the same close; failures here are moot
        let _ = client.close(close.code, &close.reason).await;
        let _ = backend.close(close.code, &close.reason).await;

        if let Err(e) = self
            .limiter
            .remove_keys_matching(&RateLimitKey::client_pattern(
                RateLimitKind::WsMessage,
                &self.message_key.client_id,
            ))
            .await
        {
            tracing::debug!("failed to drop per-connection rate buckets: {}", e);
        }

        tracing::debug!(
            connection_id = %self.connection_id,
            code = close.code,
            reason = %close.reason,
            "websocket session closed"
        );
        close
    }

    /// Account one client message; a rejection closes the session
    async fn account_message(&self) -> Option<SessionClose> {
        match self
            .limiter
            .check_and_consume(&self.message_key, &self.message_limit)
            .await
        {
            Ok(decision) if decision.allowed => None,
            Ok(_) => Some(SessionClose {
                code: CLOSE_RATE_LIMITED,
                reason: "rate limited".to_string(),
            }),
            Err(e) if self.limiter_fail_open => {
                tracing::warn!("message rate limiter unavailable, failing open: {}", e);
                None
            }
            Err(_) => Some(SessionClose {
                code: CLOSE_UNEXPECTED,
                reason: "rate limiter unavailable".to_string(),
            }),
        }
    }
}

impl GatewayCore {
    /// Drive one upgrade request through the WebSocket pipeline
    pub async fn upgrade(&self, request: &GatewayRequest) -> WebSocketUpgradeResult {
        let source = match self.preflight(request) {
            Ok(source) => source,
            Err(outcome) => return WebSocketUpgradeResult::Refused(outcome),
        };

        let path = normalize_path(request.path());
        let route = match self
            .registry
            .find_route_async(&path, request.method.as_str())
            .await
        {
            RouteLookup::Matched(route) => route,
            _ => {
                return WebSocketUpgradeResult::Refused(GatewayOutcome::RouteNotFound { path });
            }
        };

        if route.endpoint().endpoint_type != EndpointType::Websocket {
            return WebSocketUpgradeResult::NotWebSocket;
        }

        if let Err(outcome) = self.check_route_access(&source, &route) {
            return WebSocketUpgradeResult::Refused(outcome);
        }

        let token = match self.authenticator.authenticate(&request.headers, &route).await {
            RouteAuthResult::NotRequired => None,
            RouteAuthResult::Authenticated(token) => Some(token),
            RouteAuthResult::Unauthorized(reason) => {
                return WebSocketUpgradeResult::Refused(GatewayOutcome::Unauthorized { reason });
            }
            RouteAuthResult::Forbidden(reason) => {
                return WebSocketUpgradeResult::Refused(GatewayOutcome::Forbidden { reason });
            }
        };

        let client_id = token
            .as_ref()
            .map(|t| t.subject.clone())
            .unwrap_or_else(|| source.ip.clone());
        let connection_key =
            RateLimitKey::ws_connection(client_id.clone(), route.service.service_id.clone());
        let connection_limit = self.resolver.resolve(
            RateLimitKind::WsConnection,
            route.service.rate_limit.as_ref(),
            None,
        );
        if let Some(outcome) = self.enforce_limit(&connection_key, &connection_limit).await {
            return WebSocketUpgradeResult::Refused(outcome);
        }

        // Claim a connection slot; the permit releases it on drop
        let max_connections = self.config.websocket.max_connections;
        if self
            .ws_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max_connections).then_some(active + 1)
            })
            .is_err()
        {
            tracing::warn!(max_connections, "websocket connection cap reached");
            return WebSocketUpgradeResult::CapacityExceeded;
        }
        let permit = ConnectionPermit {
            active: Arc::clone(&self.ws_active),
        };

        let backend_uri = match backend_websocket_uri(
            &route.service.base_url,
            &route.target_path,
            request.uri.query(),
        ) {
            Ok(uri) => uri,
            Err(message) => {
                return WebSocketUpgradeResult::Refused(GatewayOutcome::Error { message });
            }
        };

        let connection_id = uuid::Uuid::new_v4().to_string();
        let message_limit = self.resolver.resolve(
            RateLimitKind::WsMessage,
            route.service.rate_limit.as_ref(),
            route.endpoint().rate_limit_override.as_ref(),
        );
        let message_key = RateLimitKey::ws_message(
            format!("{}#{}", client_id, connection_id),
            route.service.service_id.clone(),
        );

        WebSocketUpgradeResult::Authorized {
            backend_uri,
            token,
            session: WebSocketSession {
                config: self.config.websocket.clone(),
                limiter: Arc::clone(&self.limiter),
                message_key,
                message_limit,
                limiter_fail_open: self.config.rate_limit.fail_open,
                connection_id,
                _permit: permit,
            },
        }
    }
}

/// Derive the backend URI: `http` becomes `ws`, `https` becomes `wss`
fn backend_websocket_uri(
    base_url: &str,
    target_path: &str,
    query: Option<&str>,
) -> std::result::Result<Uri, String> {
    let base: Uri = base_url
        .parse()
        .map_err(|_| format!("service base URL '{}' is invalid", base_url))?;
    let scheme = match base.scheme_str() {
        Some("https") => "wss",
        _ => "ws",
    };
    let authority = base
        .authority()
        .ok_or_else(|| format!("service base URL '{}' has no authority", base_url))?;

    let base_path = base.path().trim_end_matches('/');
    let mut uri = format!("{}://{}{}", scheme, authority, base_path);
    if !target_path.starts_with('/') {
        uri.push('/');
    }
    uri.push_str(target_path);
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(query);
    }

    uri.parse()
        .map_err(|_| format!("computed backend URI '{}' is invalid", uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RateLimitSettings, WindowSettings};
    use crate::duration::ConfigDuration;
    use crate::pattern::{MethodSet, PathPattern};
    use crate::registry::{EndpointConfig, ServiceRegistration, Visibility};
    use http::Method;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Channel-backed peer for exercising the relay
    struct ChannelPeer {
        incoming: mpsc::Receiver<WsMessage>,
        outgoing: mpsc::Sender<WsMessage>,
        closed: Arc<Mutex<Option<SessionClose>>>,
    }

    impl ChannelPeer {
        fn pair() -> (
            Self,
            mpsc::Sender<WsMessage>,
            mpsc::Receiver<WsMessage>,
            Arc<Mutex<Option<SessionClose>>>,
        ) {
            let (in_tx, in_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(16);
            let closed = Arc::new(Mutex::new(None));
            (
                Self {
                    incoming: in_rx,
                    outgoing: out_tx,
                    closed: Arc::clone(&closed),
                },
                in_tx,
                out_rx,
                closed,
            )
        }
    }

    #[async_trait::async_trait]
    impl MessagePeer for ChannelPeer {
        async fn recv(&mut self) -> Option<WsMessage> {
            self.incoming.recv().await
        }

        async fn send(&mut self, message: WsMessage) -> Result<()> {
            self.outgoing
                .send(message)
                .await
                .map_err(|_| crate::error::Error::Internal("peer gone".to_string()))
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
            *self.closed.lock().unwrap() = Some(SessionClose {
                code,
                reason: reason.to_string(),
            });
            Ok(())
        }
    }

    fn ws_endpoint(pattern: &str) -> EndpointConfig {
        let mut endpoint = EndpointConfig::new(
            PathPattern::parse(pattern).unwrap(),
            MethodSet::new(["GET"]),
        );
        endpoint.endpoint_type = EndpointType::Websocket;
        endpoint.visibility = Some(Visibility::Public);
        endpoint
    }

    async fn ws_core(config: GatewayConfig) -> Arc<GatewayCore> {
        let core = GatewayCore::builder(config).build().await.unwrap();
        core.registry()
            .register(
                ServiceRegistration::builder("chat", "https://chat.internal:8443")
                    .default_visibility(Visibility::Public)
                    .endpoint(ws_endpoint("/ws/rooms/{room}"))
                    .endpoint({
                        let mut e = EndpointConfig::new(
                            PathPattern::parse("/api/http").unwrap(),
                            MethodSet::new(["GET"]),
                        );
                        e.visibility = Some(Visibility::Public);
                        e
                    })
                    .build(),
                &["gateway:admin".to_string()],
            )
            .await
            .unwrap();
        core
    }

    fn upgrade_request(path: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, path.parse().unwrap())
    }

    #[tokio::test]
    async fn test_upgrade_authorized_derives_wss_uri() {
        let core = ws_core(GatewayConfig::default()).await;
        let result = core.upgrade(&upgrade_request("/ws/rooms/lobby?greet=1")).await;

        let WebSocketUpgradeResult::Authorized { backend_uri, token, session } = result else {
            panic!("expected Authorized");
        };
        assert_eq!(
            backend_uri.to_string(),
            "wss://chat.internal:8443/ws/rooms/lobby?greet=1"
        );
        assert!(token.is_none());
        assert!(!session.connection_id().is_empty());
        assert_eq!(core.health().await.active_websocket_sessions, 1);

        drop(session);
        assert_eq!(core.health().await.active_websocket_sessions, 0);
    }

    #[tokio::test]
    async fn test_http_endpoint_is_not_websocket() {
        let core = ws_core(GatewayConfig::default()).await;
        let result = core.upgrade(&upgrade_request("/api/http")).await;
        assert!(matches!(result, WebSocketUpgradeResult::NotWebSocket));
    }

    #[tokio::test]
    async fn test_unknown_path_refused() {
        let core = ws_core(GatewayConfig::default()).await;
        let result = core.upgrade(&upgrade_request("/nope")).await;
        assert!(matches!(
            result,
            WebSocketUpgradeResult::Refused(GatewayOutcome::RouteNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let config = GatewayConfig {
            websocket: crate::config::WebSocketConfig {
                max_connections: 1,
                ..crate::config::WebSocketConfig::default()
            },
            ..GatewayConfig::default()
        };
        let core = ws_core(config).await;

        let first = core.upgrade(&upgrade_request("/ws/rooms/a")).await;
        assert!(matches!(first, WebSocketUpgradeResult::Authorized { .. }));

        let second = core.upgrade(&upgrade_request("/ws/rooms/b")).await;
        assert!(matches!(second, WebSocketUpgradeResult::CapacityExceeded));

        // Releasing the first slot admits the next upgrade
        drop(first);
        let third = core.upgrade(&upgrade_request("/ws/rooms/c")).await;
        assert!(matches!(third, WebSocketUpgradeResult::Authorized { .. }));
    }

    async fn session_from(core: &Arc<GatewayCore>, path: &str) -> WebSocketSession {
        match core.upgrade(&upgrade_request(path)).await {
            WebSocketUpgradeResult::Authorized { session, .. } => session,
            _ => panic!("expected Authorized"),
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_messages() {
        let core = ws_core(GatewayConfig::default()).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, client_tx, _client_out, client_closed) = ChannelPeer::pair();
        let (backend, backend_tx, mut backend_out, backend_closed) = ChannelPeer::pair();

        let relay = tokio::spawn({
            let cancel = CancellationToken::new();
            async move { session.relay(client, backend, &cancel).await }
        });

        client_tx
            .send(WsMessage::Text("hello backend".to_string()))
            .await
            .unwrap();
        assert_eq!(
            backend_out.recv().await,
            Some(WsMessage::Text("hello backend".to_string()))
        );

        // Client close propagates to both sides with the same reason
        client_tx
            .send(WsMessage::Close {
                code: CLOSE_NORMAL,
                reason: "done".to_string(),
            })
            .await
            .unwrap();
        drop(backend_tx);

        let close = relay.await.unwrap();
        assert_eq!(close.code, CLOSE_NORMAL);
        assert_eq!(close.reason, "done");
        assert_eq!(backend_closed.lock().unwrap().as_ref(), Some(&close));
        assert_eq!(client_closed.lock().unwrap().as_ref(), Some(&close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_normal() {
        let config = GatewayConfig {
            websocket: crate::config::WebSocketConfig {
                idle_timeout: ConfigDuration::from_secs(30),
                ping_interval: ConfigDuration::from_secs(0),
                ..crate::config::WebSocketConfig::default()
            },
            ..GatewayConfig::default()
        };
        let core = ws_core(config).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, _client_tx, _client_out, _) = ChannelPeer::pair();
        let (backend, _backend_tx, _backend_out, _) = ChannelPeer::pair();

        let close = session.relay(client, backend, &CancellationToken::new()).await;
        assert_eq!(close.code, CLOSE_NORMAL);
        assert_eq!(close.reason, "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_cap_closes_normal() {
        let config = GatewayConfig {
            websocket: crate::config::WebSocketConfig {
                idle_timeout: ConfigDuration::from_secs(600),
                max_lifetime: ConfigDuration::from_secs(60),
                ping_interval: ConfigDuration::from_secs(0),
                ..crate::config::WebSocketConfig::default()
            },
            ..GatewayConfig::default()
        };
        let core = ws_core(config).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, _client_tx, _client_out, _) = ChannelPeer::pair();
        let (backend, _backend_tx, _backend_out, _) = ChannelPeer::pair();

        let close = session.relay(client, backend, &CancellationToken::new()).await;
        assert_eq!(close.code, CLOSE_NORMAL);
        assert_eq!(close.reason, "lifetime");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_closes_protocol_error() {
        let config = GatewayConfig {
            websocket: crate::config::WebSocketConfig {
                idle_timeout: ConfigDuration::from_secs(600),
                max_lifetime: ConfigDuration::from_secs(3600),
                ping_interval: ConfigDuration::from_secs(10),
                ping_timeout: ConfigDuration::from_secs(5),
                ..crate::config::WebSocketConfig::default()
            },
            ..GatewayConfig::default()
        };
        let core = ws_core(config).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, _client_tx, mut client_out, _) = ChannelPeer::pair();
        let (backend, _backend_tx, _backend_out, _) = ChannelPeer::pair();

        let relay = tokio::spawn({
            let cancel = CancellationToken::new();
            async move { session.relay(client, backend, &cancel).await }
        });

        // The ping goes out and is never answered
        assert!(matches!(client_out.recv().await, Some(WsMessage::Ping(_))));
        let close = relay.await.unwrap();
        assert_eq!(close.code, CLOSE_PROTOCOL_ERROR);
        assert_eq!(close.reason, "ping timeout");
    }

    #[tokio::test]
    async fn test_message_rate_limit_closes_4429() {
        let config = GatewayConfig {
            rate_limit: RateLimitSettings {
                websocket_message: WindowSettings {
                    requests_per_window: 2,
                    window: ConfigDuration::from_secs(3600),
                    burst_capacity: 2,
                },
                ..RateLimitSettings::default()
            },
            ..GatewayConfig::default()
        };
        let core = ws_core(config).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, client_tx, _client_out, _) = ChannelPeer::pair();
        let (backend, _backend_tx, mut backend_out, backend_closed) = ChannelPeer::pair();

        let relay = tokio::spawn({
            let cancel = CancellationToken::new();
            async move { session.relay(client, backend, &cancel).await }
        });

        for i in 0..3 {
            client_tx
                .send(WsMessage::Text(format!("message {}", i)))
                .await
                .unwrap();
        }
        // The first two relay through; the third closes the session
        assert!(backend_out.recv().await.is_some());
        assert!(backend_out.recv().await.is_some());

        let close = relay.await.unwrap();
        assert_eq!(close.code, CLOSE_RATE_LIMITED);
        assert_eq!(close.reason, "rate limited");
        assert_eq!(backend_closed.lock().unwrap().as_ref().unwrap().code, CLOSE_RATE_LIMITED);
    }

    #[tokio::test]
    async fn test_cancellation_closes_going_away() {
        let core = ws_core(GatewayConfig::default()).await;
        let session = session_from(&core, "/ws/rooms/lobby").await;

        let (client, _client_tx, _client_out, _) = ChannelPeer::pair();
        let (backend, _backend_tx, _backend_out, _) = ChannelPeer::pair();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let close = session.relay(client, backend, &cancel).await;
        assert_eq!(close.code, CLOSE_GOING_AWAY);
    }

    #[test]
    fn test_backend_uri_scheme_mapping() {
        assert_eq!(
            backend_websocket_uri("http://b:9090", "/ws", None).unwrap().to_string(),
            "ws://b:9090/ws"
        );
        assert_eq!(
            backend_websocket_uri("https://b", "/ws/x", Some("a=1")).unwrap().to_string(),
            "wss://b/ws/x?a=1"
        );
    }
}
