// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use relaymux::{
  common::protocol::tunnel::{quinn_tunnel::QuinnSession, ArcSession, MonotonicAtomicGenerator},
  config::{HopTransportConfig, ServerConfig},
  server::{dial::TcpDialer, hop::QuinnDialer, SessionServer},
  util::ALPN_RELAYMUX_1,
};
use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Parameters used to run a relaymux server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub config: Option<PathBuf>,
  pub cert: PathBuf,
  pub key: PathBuf,
  pub listen: SocketAddr,
}

/// Accept QUIC sessions until interrupted, serving each on its own task
#[tracing::instrument(skip(args), fields(listen = ?args.listen), err)]
pub async fn server_main(args: self::ServerArgs) -> Result<()> {
  let config = match args.config.as_ref() {
    Some(path) => ServerConfig::load(path).context("Failed loading server configuration")?,
    None => ServerConfig::default(),
  };
  let endpoint = quinn::Endpoint::server(build_quinn_config(&args)?, args.listen)
    .context("Failed binding the QUIC endpoint")?;

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  // Session IDs are increments atop the unix timestamp millisecond we started the server
  let session_ids = Arc::new(MonotonicAtomicGenerator::new(
    std::time::SystemTime::now()
      .duration_since(std::time::SystemTime::UNIX_EPOCH)
      .context("System clock precedes the unix epoch")?
      .as_millis() as u64,
  ));

  let hop_endpoint = build_hop_endpoint(&config.hop, args.listen)?;
  let hop_dialer = Arc::new(QuinnDialer::new(
    hop_endpoint.clone(),
    config.hop.server_name.clone(),
    session_ids.clone(),
  ));
  let server = Arc::new(SessionServer::new(&config, Arc::new(TcpDialer), hop_dialer));
  let reaper = server.reaper();
  if reaper.start() {
    tracing::info!(
      timeout = config.mux.session_idle_timeout_secs,
      "Reaping sessions without streams"
    );
  }

  tracing::info!(addr = ?endpoint.local_addr()?, "Accepting sessions");
  loop {
    let connecting = tokio::select! {
      _ = shutdown.cancelled() => break,
      incoming = endpoint.accept() => match incoming {
        Some(connecting) => connecting,
        None => break,
      },
    };
    let server = Arc::clone(&server);
    let id = session_ids.next();
    let span = tracing::info_span!("connection", remote = ?connecting.remote_address(), session = ?id);
    tokio::task::spawn(
      async move {
        let connection = match connecting.await {
          Ok(connection) => connection,
          Err(error) => {
            tracing::debug!(%error, "Connection failed before establishment");
            return;
          }
        };
        let session: ArcSession = Arc::new(QuinnSession::new(id, connection));
        // Failures are logged within the session span
        let _ = server.serve_session(session, None).await;
      }
      .instrument(span),
    );
  }

  tracing::info!("Shutting down");
  reaper.stop().await;
  server.shutdown();
  endpoint.close(0u32.into(), b"shutdown");
  hop_endpoint.close(0u32.into(), b"shutdown");
  endpoint.wait_idle().await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}

fn read_pem_items(path: &Path) -> Result<Vec<rustls_pemfile::Item>> {
  let pem = std::fs::read(path).with_context(|| format!("Failed reading {:?}", path))?;
  rustls_pemfile::read_all(&mut pem.as_slice())
    .with_context(|| format!("Failed parsing PEM from {:?}", path))
}

fn read_certificates(path: &Path) -> Result<Vec<rustls::Certificate>> {
  let certs: Vec<_> = read_pem_items(path)?
    .into_iter()
    .filter_map(|item| match item {
      rustls_pemfile::Item::X509Certificate(der) => Some(rustls::Certificate(der)),
      _ => None,
    })
    .collect();
  if certs.is_empty() {
    anyhow::bail!("No certificates found in {:?}", path);
  }
  Ok(certs)
}

fn read_private_key(path: &Path) -> Result<rustls::PrivateKey> {
  read_pem_items(path)?
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(der)
      | rustls_pemfile::Item::RSAKey(der)
      | rustls_pemfile::Item::ECKey(der) => Some(rustls::PrivateKey(der)),
      _ => None,
    })
    .with_context(|| format!("No private key found in {:?}", path))
}

fn build_transport_config() -> Result<quinn::TransportConfig> {
  let mut transport_config = quinn::TransportConfig::default();
  transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
  transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
  Ok(transport_config)
}

fn build_quinn_config(args: &ServerArgs) -> Result<quinn::ServerConfig> {
  let cert_chain = read_certificates(&args.cert)?;
  let priv_key = read_private_key(&args.key)?;
  let mut crypto = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(cert_chain, priv_key)
    .context("Certificate and private key were rejected")?;
  crypto.alpn_protocols = vec![ALPN_RELAYMUX_1.to_vec()];
  let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  server_config.transport_config(Arc::new(build_transport_config()?));
  Ok(server_config)
}

/// Client endpoint for dialing further hops, trusting only the configured CA bundle
fn build_hop_endpoint(hop: &HopTransportConfig, listen: SocketAddr) -> Result<quinn::Endpoint> {
  let mut roots = rustls::RootCertStore::empty();
  match hop.ca_cert.as_ref() {
    Some(ca_cert) => {
      for cert in read_certificates(ca_cert)? {
        roots.add(&cert).context("Invalid hop CA certificate")?;
      }
    }
    None => tracing::warn!("No hop CA configured; connections through hops will fail"),
  }
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  crypto.alpn_protocols = vec![ALPN_RELAYMUX_1.to_vec()];
  let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
  client_config.transport_config(Arc::new(build_transport_config()?));

  let unspecified = match listen.ip() {
    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
  };
  let mut endpoint = quinn::Endpoint::client(SocketAddr::new(unspecified, 0))
    .context("Failed binding the hop endpoint")?;
  endpoint.set_default_client_config(client_config);
  Ok(endpoint)
}
