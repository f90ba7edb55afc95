// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-stream connect-and-relay handling
//!
//! Every proxy stream starts with a [`ConnectRequest`]. The request is read,
//! checked against the destination policy, and connected either directly or
//! through the first of its hops, after which the stream is relayed until
//! either side closes or the stream goes idle.
use std::sync::Arc;

use tokio::{io::AsyncWriteExt, time::Duration};
use url::Url;

use super::{
  dial::{BoxedDestination, DestinationDialer},
  hop::{HopError, MuxSessionPool},
  rate_limit::RateLimiterRegistry,
  relay::{relay, RelayOptions, RelayStats},
  session::SessionContext,
};
use crate::{
  common::{
    policy::DestinationPolicy,
    protocol::{
      compression::CompressMethod,
      messages::{self, read_connect_request, ConnectRequest, MessageError},
      tunnel::{BoxedMuxStream, MuxStream},
    },
  },
  config::MuxConfig,
};

/// Dial timeout for requests which leave it unset
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(10000);

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  #[error("Proxy stream arrived before authentication")]
  Unauthenticated,
  #[error("Session negotiated unsupported compression {0:?}")]
  UnsupportedCompressor(String),
  #[error("Failed to read connect request: {0}")]
  ReadRequestFailed(#[source] MessageError),
  #[error("Destination {addr} rejected by proxy policy")]
  PolicyRejected { addr: String },
  #[error("Request routes through {hops} hops; at most {max} are allowed")]
  HopLimitExceeded { hops: usize, max: usize },
  #[error("Failed to dial {network} destination {addr}: {source}")]
  DialFailed {
    network: String,
    addr: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid hop address {hop:?}: {source}")]
  HopParseFailed {
    hop: String,
    #[source]
    source: url::ParseError,
  },
  #[error("Failed to connect through hop {hop}: {source}")]
  HopConnectFailed {
    hop: String,
    #[source]
    source: HopError,
  },
}

#[derive(Debug)]
pub struct StreamDispatcher {
  policy: DestinationPolicy,
  dialer: Arc<dyn DestinationDialer>,
  hops: Arc<MuxSessionPool>,
  rate_limits: Arc<RateLimiterRegistry>,
  stream_idle_timeout: Duration,
  max_hops: usize,
}

impl StreamDispatcher {
  pub fn new(
    policy: DestinationPolicy,
    dialer: Arc<dyn DestinationDialer>,
    hops: Arc<MuxSessionPool>,
    rate_limits: Arc<RateLimiterRegistry>,
    mux: &MuxConfig,
  ) -> Self {
    Self {
      policy,
      dialer,
      hops,
      rate_limits,
      stream_idle_timeout: mux.stream_idle_timeout(),
      max_hops: mux.max_hops,
    }
  }

  pub fn hops(&self) -> &Arc<MuxSessionPool> {
    &self.hops
  }

  /// Connects and relays one proxy stream; the stream is closed when this returns
  #[tracing::instrument(
    name = "stream",
    skip_all,
    fields(session = ?ctx.id(), stream = ?stream.id(), destination = tracing::field::Empty)
  )]
  pub async fn handle_proxy_stream(
    &self,
    mut stream: BoxedMuxStream,
    ctx: &SessionContext,
  ) -> Result<RelayStats, DispatchError> {
    match self.establish(&mut stream, ctx).await {
      Ok((destination, options)) => {
        let stats = relay(stream, destination, options).await;
        tracing::debug!(
          upstream = stats.upstream_bytes,
          downstream = stats.downstream_bytes,
          retries = stats.timeout_retries,
          "Relay finished"
        );
        Ok(stats)
      }
      Err(error) => {
        if let Err(close_error) = stream.shutdown().await {
          tracing::trace!(?close_error, "Stream already closed");
        }
        Err(error)
      }
    }
  }

  async fn establish(
    &self,
    stream: &mut BoxedMuxStream,
    ctx: &SessionContext,
  ) -> Result<(BoxedDestination, RelayOptions), DispatchError> {
    let auth = ctx.auth().ok_or(DispatchError::Unauthenticated)?;
    let compress = CompressMethod::from_name(&auth.compress_method)
      .ok_or_else(|| DispatchError::UnsupportedCompressor(auth.compress_method.clone()))?;

    let request = read_connect_request(&mut *stream)
      .await
      .map_err(DispatchError::ReadRequestFailed)?;
    tracing::Span::current().record("destination", request.addr.as_str());

    if !self.policy.allowed(&request.addr) {
      return Err(DispatchError::PolicyRejected { addr: request.addr });
    }
    let hop_count = request.options.hops.len();
    if hop_count > self.max_hops {
      return Err(DispatchError::HopLimitExceeded {
        hops: hop_count,
        max: self.max_hops,
      });
    }

    let dial_timeout = match request.options.dial_timeout_ms {
      0 => DEFAULT_DIAL_TIMEOUT,
      ms => Duration::from_millis(ms),
    };
    let idle_timeout = match request.options.read_timeout_ms {
      0 => self.stream_idle_timeout,
      ms => Duration::from_millis(ms),
    };

    let destination = match request.next_hop() {
      None => {
        tracing::debug!(network = %request.network, ?dial_timeout, "Dialing destination");
        self
          .dialer
          .dial(&request.network, &request.addr, dial_timeout)
          .await
          .map_err(|source| DispatchError::DialFailed {
            network: request.network.clone(),
            addr: request.addr.clone(),
            source,
          })?
      }
      Some((hop, forwarded)) => self.connect_through(hop, forwarded).await?,
    };

    let options = RelayOptions {
      compress,
      idle_timeout,
      bucket: self.rate_limits.get_bucket(&auth.user),
      session_activity: ctx.activity().clone(),
    };
    Ok((destination, options))
  }

  /// Opens a stream on the hop's session and issues the remaining request on it
  async fn connect_through(
    &self,
    hop: &str,
    forwarded: ConnectRequest,
  ) -> Result<BoxedDestination, DispatchError> {
    let url = Url::parse(hop).map_err(|source| DispatchError::HopParseFailed {
      hop: hop.to_string(),
      source,
    })?;
    let connect_failed = |source| DispatchError::HopConnectFailed {
      hop: hop.to_string(),
      source,
    };
    tracing::debug!(%url, remaining = forwarded.options.hops.len(), "Connecting through hop");
    let mut outbound = self.hops.open_stream(&url).await.map_err(connect_failed)?;
    messages::connect(
      &mut outbound,
      &forwarded.network,
      &forwarded.addr,
      forwarded.options,
    )
    .await
    .map_err(|error| connect_failed(HopError::Forward(error)))?;
    Ok(Box::new(outbound) as BoxedDestination)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::{Arc, Mutex};

  use futures::{future::BoxFuture, FutureExt};
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
    time::{Duration, Instant},
  };

  use super::{DispatchError, RelayStats, StreamDispatcher, DEFAULT_DIAL_TIMEOUT};
  use crate::{
    common::{
      authentication::{HandshakeError, HopIdentity},
      peer_relay::InMemoryPeerRelayRegistry,
      policy::DestinationPolicy,
      protocol::{
        messages::{
          connect, read_auth_request, read_connect_request, write_message, AuthCode, AuthRequest,
          AuthResponse, ConnectRequest, StreamOptions,
        },
        tunnel::{duplex, MuxSession, SessionId},
      },
    },
    config::{MuxConfig, ProxyLimitConfig},
    server::{
      dial::{BoxedDestination, DestinationDialer},
      hop::{tests::DuplexDialer, HopError, MuxSessionPool},
      rate_limit::RateLimiterRegistry,
      session::SessionContext,
    },
    util::deadline::DeadlineStream,
  };

  /// Records dials and hands the far end of each in-memory destination to the test
  #[derive(Debug)]
  pub(crate) struct RecordingDialer {
    pub(crate) dialed: Mutex<Vec<(String, String, Duration)>>,
    far_ends: mpsc::UnboundedSender<DuplexStream>,
  }

  impl RecordingDialer {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
      let (far_ends, receiver) = mpsc::unbounded_channel();
      let dialer = Self {
        dialed: Mutex::new(Vec::new()),
        far_ends,
      };
      (dialer, receiver)
    }

    pub(crate) fn dial_count(&self) -> usize {
      self.dialed.lock().unwrap().len()
    }
  }

  impl DestinationDialer for RecordingDialer {
    fn dial<'a>(
      &'a self,
      network: &'a str,
      addr: &'a str,
      timeout: Duration,
    ) -> BoxFuture<'a, std::io::Result<BoxedDestination>> {
      self
        .dialed
        .lock()
        .unwrap()
        .push((network.to_string(), addr.to_string(), timeout));
      let result = if addr.starts_with("unreachable") {
        Err(std::io::ErrorKind::ConnectionRefused.into())
      } else {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.far_ends.send(far).unwrap();
        Ok(Box::new(DeadlineStream::new(near)) as BoxedDestination)
      };
      futures::future::ready(result).boxed()
    }
  }

  pub(crate) fn auth_for(user: &str) -> AuthRequest {
    AuthRequest {
      user: user.to_string(),
      compress_method: "none".to_string(),
      cipher_method: "aes-256-gcm".to_string(),
      cipher_counter: 7,
      p2sp_room_id: None,
      p2sp_conn_id: None,
    }
  }

  struct Fixture {
    dispatcher: StreamDispatcher,
    dialer: Arc<RecordingDialer>,
    far_ends: mpsc::UnboundedReceiver<DuplexStream>,
    ctx: Arc<SessionContext>,
    client: duplex::DuplexSession,
  }

  fn fixture(policy: DestinationPolicy, hops: Arc<MuxSessionPool>) -> Fixture {
    let (dialer, far_ends) = RecordingDialer::new();
    let dialer = Arc::new(dialer);
    let dispatcher = StreamDispatcher::new(
      policy,
      dialer.clone(),
      hops,
      Arc::new(RateLimiterRegistry::disabled()),
      &MuxConfig {
        max_hops: 2,
        ..MuxConfig::default()
      },
    );
    let duplex::EntangledSessions {
      listener,
      connector,
    } = duplex::channel_with_ids(SessionId::new(1), SessionId::new(2));
    let ctx = Arc::new(SessionContext::new(
      Arc::new(listener),
      Some(auth_for("alice")),
      Arc::new(InMemoryPeerRelayRegistry::new()),
    ));
    Fixture {
      dispatcher,
      dialer,
      far_ends,
      ctx,
      client: connector,
    }
  }

  fn unused_pool() -> Arc<MuxSessionPool> {
    let dialer = DuplexDialer::new(|hop, _| panic!("unexpected dial to {}", hop));
    Arc::new(MuxSessionPool::new(
      Arc::new(dialer),
      HopIdentity::new("relay", "", 1),
    ))
  }

  async fn request(fixture: &Fixture, request: &ConnectRequest) -> Result<RelayStats, DispatchError> {
    let mut client_stream = fixture.client.open_stream().await.unwrap();
    write_message(&mut client_stream, request).await.unwrap();
    let stream = fixture.ctx.session().accept_stream().await.unwrap();
    let result = fixture
      .dispatcher
      .handle_proxy_stream(stream, &fixture.ctx)
      .await;
    // Failed streams are closed without a reply
    if result.is_err() {
      let mut rest = Vec::new();
      client_stream.read_to_end(&mut rest).await.unwrap();
      assert!(rest.is_empty());
    }
    result
  }

  #[tokio::test]
  async fn direct_destinations_are_dialed_and_relayed() {
    let Fixture {
      dispatcher,
      dialer,
      mut far_ends,
      ctx,
      client,
    } = fixture(DestinationPolicy::allow_all(), unused_pool());
    let mut client_stream = client.open_stream().await.unwrap();
    connect(&mut client_stream, "tcp", "example.test:80", StreamOptions::default())
      .await
      .unwrap();
    client_stream.write_all(b"GET /").await.unwrap();

    let stream = ctx.session().accept_stream().await.unwrap();
    let handler = tokio::spawn(async move { dispatcher.handle_proxy_stream(stream, &ctx).await });

    let mut far = far_ends.recv().await.unwrap();
    let mut buf = [0u8; 5];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /");
    far.write_all(b"200 OK").await.unwrap();
    far.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client_stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"200 OK");
    let stats = handler.await.unwrap().unwrap();
    assert_eq!(stats.upstream_bytes, 5);
    assert_eq!(stats.downstream_bytes, 6);
    let dialed = dialer.dialed.lock().unwrap().clone();
    assert_eq!(
      dialed,
      vec![(
        "tcp".to_string(),
        "example.test:80".to_string(),
        DEFAULT_DIAL_TIMEOUT
      )]
    );
  }

  #[tokio::test]
  async fn rejected_destinations_are_never_dialed() {
    let policy = DestinationPolicy::from_config(&ProxyLimitConfig {
      allow: vec![],
      deny: vec!["*.internal".to_string()],
    });
    let fixture = fixture(policy, unused_pool());
    let result = request(
      &fixture,
      &ConnectRequest::new("tcp", "db.internal:5432", StreamOptions::default()),
    )
    .await;
    assert!(matches!(result, Err(DispatchError::PolicyRejected { addr }) if addr == "db.internal:5432"));
    assert_eq!(fixture.dialer.dial_count(), 0);
  }

  #[tokio::test]
  async fn malformed_requests_and_dial_failures_abort_the_stream() {
    let fixture = fixture(DestinationPolicy::allow_all(), unused_pool());

    let mut client_stream = fixture.client.open_stream().await.unwrap();
    client_stream.write_all(&[0, 0, 0, 2, b'{', b'[']).await.unwrap();
    let stream = fixture.ctx.session().accept_stream().await.unwrap();
    let result = fixture
      .dispatcher
      .handle_proxy_stream(stream, &fixture.ctx)
      .await;
    assert!(matches!(result, Err(DispatchError::ReadRequestFailed(_))));

    let options = StreamOptions {
      dial_timeout_ms: 250,
      ..StreamOptions::default()
    };
    let result = request(
      &fixture,
      &ConnectRequest::new("tcp", "unreachable.test:80", options),
    )
    .await;
    assert!(matches!(result, Err(DispatchError::DialFailed { .. })));
    let dialed = fixture.dialer.dialed.lock().unwrap().clone();
    assert_eq!(dialed[0].2, Duration::from_millis(250));
  }

  #[tokio::test]
  async fn hop_lists_are_bounded_and_parsed() {
    let fixture = fixture(DestinationPolicy::allow_all(), unused_pool());
    let hops = |list: &[&str]| StreamOptions {
      hops: list.iter().map(|h| h.to_string()).collect(),
      ..StreamOptions::default()
    };

    let result = request(
      &fixture,
      &ConnectRequest::new("tcp", "a.test:80", hops(&["quic://a:1", "quic://b:1", "quic://c:1"])),
    )
    .await;
    assert!(matches!(
      result,
      Err(DispatchError::HopLimitExceeded { hops: 3, max: 2 })
    ));

    let result = request(
      &fixture,
      &ConnectRequest::new("tcp", "a.test:80", hops(&["not a url"])),
    )
    .await;
    assert!(matches!(result, Err(DispatchError::HopParseFailed { hop, .. }) if hop == "not a url"));
    assert_eq!(fixture.dialer.dial_count(), 0);
  }

  #[tokio::test]
  async fn first_hop_receives_the_remaining_hops() {
    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let seen = forwarded.clone();
    let hop_dialer = DuplexDialer::new(move |_, listener: duplex::DuplexSession| {
      let seen = seen.clone();
      tokio::spawn(async move {
        let mut handshake = listener.accept_stream().await.unwrap();
        read_auth_request(&mut handshake).await.unwrap();
        write_message(&mut handshake, &AuthResponse::ok()).await.unwrap();
        let mut stream = listener.accept_stream().await.unwrap();
        let request = read_connect_request(&mut stream).await.unwrap();
        seen.lock().unwrap().push(request);
        stream.write_all(b"via hop").await.unwrap();
        stream.shutdown().await.unwrap();
      });
    });
    let pool = Arc::new(MuxSessionPool::new(
      Arc::new(hop_dialer),
      HopIdentity::new("relay", "", 1),
    ));
    let fixture = fixture(DestinationPolicy::allow_all(), pool.clone());

    let options = StreamOptions {
      dial_timeout_ms: 3000,
      read_timeout_ms: 0,
      hops: vec!["quic://a.test:4433".to_string(), "quic://b.test:4433".to_string()],
    };
    let mut client_stream = fixture.client.open_stream().await.unwrap();
    connect(&mut client_stream, "tcp", "final.test:443", options)
      .await
      .unwrap();
    let stream = fixture.ctx.session().accept_stream().await.unwrap();
    let stats = fixture
      .dispatcher
      .handle_proxy_stream(stream, &fixture.ctx)
      .await
      .unwrap();
    assert_eq!(stats.downstream_bytes, 7);

    let mut reply = Vec::new();
    client_stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"via hop");
    let forwarded = forwarded.lock().unwrap().clone();
    assert_eq!(
      forwarded,
      vec![ConnectRequest::new(
        "tcp",
        "final.test:443",
        StreamOptions {
          dial_timeout_ms: 3000,
          read_timeout_ms: 0,
          hops: vec!["quic://b.test:4433".to_string()],
        }
      )]
    );
    assert_eq!(pool.len(), 1);
    assert_eq!(fixture.dialer.dial_count(), 0);
  }

  #[tokio::test]
  async fn failed_hop_handshakes_abort_the_stream() {
    let hop_dialer = Arc::new(DuplexDialer::new(|_, listener: duplex::DuplexSession| {
      tokio::spawn(async move {
        let mut handshake = listener.accept_stream().await.unwrap();
        read_auth_request(&mut handshake).await.unwrap();
        let rejected = AuthResponse {
          code: AuthCode::Rejected,
        };
        write_message(&mut handshake, &rejected).await.unwrap();
      });
    }));
    let pool = Arc::new(MuxSessionPool::new(
      hop_dialer.clone(),
      HopIdentity::new("relay", "", 1),
    ));
    let fixture = fixture(DestinationPolicy::allow_all(), pool.clone());

    let options = StreamOptions {
      hops: vec!["quic://a.test:4433".to_string()],
      ..StreamOptions::default()
    };
    let result = request(
      &fixture,
      &ConnectRequest::new("tcp", "final.test:443", options),
    )
    .await;
    assert!(matches!(
      result,
      Err(DispatchError::HopConnectFailed {
        hop,
        source: HopError::Handshake(HandshakeError::Rejected(AuthCode::Rejected)),
      }) if hop == "quic://a.test:4433"
    ));
    assert_eq!(hop_dialer.dialed.lock().unwrap().len(), 1);
    assert!(pool.is_empty());
    assert_eq!(fixture.dialer.dial_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn read_timeout_overrides_stream_idle_timeout() {
    let mut fixture = fixture(DestinationPolicy::allow_all(), unused_pool());
    let options = StreamOptions {
      read_timeout_ms: 1000,
      ..StreamOptions::default()
    };
    let mut client_stream = fixture.client.open_stream().await.unwrap();
    connect(&mut client_stream, "tcp", "quiet.test:80", options)
      .await
      .unwrap();
    let stream = fixture.ctx.session().accept_stream().await.unwrap();

    let started = Instant::now();
    let stats = fixture
      .dispatcher
      .handle_proxy_stream(stream, &fixture.ctx)
      .await
      .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert_eq!(stats.timeout_retries, 0);
    drop(fixture.far_ends.recv().await);
  }

  #[tokio::test]
  async fn unauthenticated_contexts_are_refused() {
    let fixture = fixture(DestinationPolicy::allow_all(), unused_pool());
    let ctx = SessionContext::new(
      fixture.ctx.session().clone(),
      None,
      Arc::new(InMemoryPeerRelayRegistry::new()),
    );
    let _client_stream = fixture.client.open_stream().await.unwrap();
    let stream = fixture.ctx.session().accept_stream().await.unwrap();
    let result = fixture.dispatcher.handle_proxy_stream(stream, &ctx).await;
    assert!(matches!(result, Err(DispatchError::Unauthenticated)));
    assert_eq!(fixture.dialer.dial_count(), 0);
  }
}
