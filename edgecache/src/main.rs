//! Edgecache - TLS-terminating caching edge server
//!
//! This is the main entry point for the Edgecache CLI.

use clap::{Parser, Subcommand};
use edgecache_core::config::{ConfigLoader, EdgecacheConfig};
use edgecache_core::response::{LoggedResponseWriter, ResponseWriter};
use edgecache_tls::{CertStore, HostTls, ServerTlsBuilder, TlsPolicy, TlsTerminator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Edgecache - TLS-terminating caching edge server
#[derive(Parser)]
#[command(name = "edgecache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with a configuration file
    Run {
        /// Path to the configuration file (TOML or JSON)
        #[arg(default_value = "edgecache.toml")]
        config: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file (TOML or JSON)
        #[arg(default_value = "edgecache.toml")]
        config: String,
    },

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    match cli.command {
        Commands::Run { config: config_path } => {
            tracing::info!("Starting Edgecache with config: {}", config_path);

            let config = match ConfigLoader::load(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("❌ Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_server(config))?;
        }

        Commands::Validate { config } => {
            tracing::info!("Validating config: {}", config);

            let result = ConfigLoader::load(&config)
                .map_err(anyhow::Error::from)
                .and_then(|c| validate(&c));

            match result {
                Ok(()) => {
                    println!("✅ Configuration '{}' is valid", config);
                }
                Err(e) => {
                    eprintln!("❌ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Edgecache v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Check a loaded configuration without touching the filesystem or the
/// network, so validation can run on a machine that is not the server.
fn validate(config: &EdgecacheConfig) -> anyhow::Result<()> {
    TlsPolicy::from_settings(
        config.tls.min_version.as_deref(),
        config.tls.max_version.as_deref(),
        config.tls.cipher_suites.as_deref(),
        config.tls.curves.as_deref(),
    )?;

    let mut tls_hosts = 0;
    for host in &config.hosts {
        let Some(tls) = &host.tls else {
            continue;
        };
        tls_hosts += 1;

        if !tls.auto && (tls.cert.is_none() || tls.key.is_none()) {
            anyhow::bail!(
                "Host {}: static TLS requires both cert and key paths",
                host.host
            );
        }
        if tls.auto && (tls.cert.is_some() || tls.key.is_some()) {
            anyhow::bail!(
                "Host {}: auto TLS and a static cert/key pair are mutually exclusive",
                host.host
            );
        }
    }

    if tls_hosts == 0 {
        anyhow::bail!("No TLS hosts configured");
    }

    config
        .bind
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.bind, e))?;

    Ok(())
}

/// Build the TLS termination state from the loaded configuration.
///
/// Any failure here aborts startup: an unreadable static pair or an
/// uninitializable certificate cache must not produce a half-configured
/// listener.
fn build_terminator(config: &EdgecacheConfig) -> anyhow::Result<TlsTerminator> {
    let policy = TlsPolicy::from_settings(
        config.tls.min_version.as_deref(),
        config.tls.max_version.as_deref(),
        config.tls.cipher_suites.as_deref(),
        config.tls.curves.as_deref(),
    )?;

    let store = Arc::new(CertStore::new());
    let mut builder = ServerTlsBuilder::new(policy, store, &config.cache_dir);

    for host in &config.hosts {
        let Some(tls) = &host.tls else {
            tracing::warn!("⚠️ Host {} has no TLS configuration, skipping", host.host);
            continue;
        };

        let host_tls = if tls.auto {
            let mut entry = HostTls::auto(&host.host, tls.acme_email.clone());
            entry.staging = tls.acme_staging;
            entry
        } else {
            match (&tls.cert, &tls.key) {
                (Some(cert), Some(key)) => HostTls::static_pair(&host.host, cert, key),
                _ => anyhow::bail!(
                    "Host {}: static TLS requires both cert and key paths",
                    host.host
                ),
            }
        };

        builder.add_host(&host_tls)?;
    }

    Ok(builder.build()?)
}

async fn run_server(config: EdgecacheConfig) -> anyhow::Result<()> {
    let terminator = Arc::new(build_terminator(&config)?);

    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", config.bind, e))?;

    tracing::info!("🚀 Edgecache v{} listening on {}", env!("CARGO_PKG_VERSION"), config.bind);

    loop {
        let (stream, peer) = listener.accept().await?;
        let terminator = terminator.clone();

        tokio::spawn(async move {
            // A failed handshake is scoped to this connection.
            match terminator.terminate(stream).await {
                Ok(tls_stream) => {
                    if let Err(e) = handle_connection(tls_stream, peer).await {
                        tracing::debug!("Connection from {} ended: {}", peer, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("❌ Handshake with {} failed: {}", peer, e);
                }
            }
        });
    }
}

/// Serialize one HTTP/1.1 response.
///
/// Headers are assembled in [`finish`](Self::finish) once the body length
/// is known, so handlers can stream chunks through the
/// [`ResponseWriter`] interface without pre-computing content length.
#[derive(Default)]
struct HttpWriteBuffer {
    status: u16,
    body: Vec<u8>,
}

impl ResponseWriter for HttpWriteBuffer {
    fn write_header(&mut self, status: u16) {
        self.status = status;
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.body.extend_from_slice(chunk);
        Ok(chunk.len())
    }
}

impl HttpWriteBuffer {
    fn finish(self) -> Vec<u8> {
        let status =
            http::StatusCode::from_u16(self.status).unwrap_or(http::StatusCode::OK);
        let reason = status.canonical_reason().unwrap_or("");

        let mut out = format!(
            "HTTP/1.1 {} {}\r\nserver: edgecache/{}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            status.as_u16(),
            reason,
            env!("CARGO_PKG_VERSION"),
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Serve one terminated connection.
///
/// Everything written to the client goes through the logged writer, so
/// the access log reports the exact status and byte count sent.
async fn handle_connection<S>(mut stream: S, peer: SocketAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut read = 0;

    loop {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            return Ok(());
        }
        read += n;

        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if read == buf.len() {
            anyhow::bail!("request head exceeds {} bytes", MAX_REQUEST_HEAD);
        }
    }

    let mut writer = LoggedResponseWriter::new(HttpWriteBuffer::default());
    writer.write_header(200);
    writer.write_chunk(b"edgecache: secure connection established\n")?;

    let status = writer.status();
    let bytes = writer.body_len();

    let raw = writer.into_inner().finish();
    stream.write_all(&raw).await?;
    stream.shutdown().await?;

    tracing::info!(peer = %peer, status, bytes, "request served");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgecache_core::config::{HostConfig, TlsHostConfig, TlsPolicyConfig};

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    fn config_with_auto_host() -> EdgecacheConfig {
        EdgecacheConfig {
            debug: false,
            bind: "127.0.0.1:8443".to_string(),
            cache_dir: "/tmp/edgecache-certs".to_string(),
            tls: TlsPolicyConfig::default(),
            hosts: vec![HostConfig {
                host: "example.com".to_string(),
                tls: Some(TlsHostConfig {
                    auto: true,
                    ..Default::default()
                }),
            }],
        }
    }

    #[test]
    fn test_validate_accepts_auto_host() {
        assert!(validate(&config_with_auto_host()).is_ok());
    }

    #[test]
    fn test_validate_rejects_incomplete_static_host() {
        let mut config = config_with_auto_host();
        config.hosts[0].tls = Some(TlsHostConfig {
            cert: Some("/etc/ssl/cert.pem".to_string()),
            ..Default::default()
        });

        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_mixed_auto_and_static() {
        let mut config = config_with_auto_host();
        let tls = config.hosts[0].tls.as_mut().unwrap();
        tls.cert = Some("/etc/ssl/cert.pem".to_string());

        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_no_tls_hosts() {
        let mut config = config_with_auto_host();
        config.hosts.clear();

        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bind_address() {
        let mut config = config_with_auto_host();
        config.bind = "not-an-address".to_string();

        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_http_response_serialization() {
        let mut writer = LoggedResponseWriter::new(HttpWriteBuffer::default());
        writer.write_header(201);
        writer.write_chunk(b"hello").unwrap();

        let raw = writer.into_inner().finish();
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }
}
