//! Standalone signaling server binary
//!
//! Run with:
//!   cargo run --bin castline-signal -- --port 8080 --token alice=secret1 --token bob=secret2
//!
//! With TLS:
//!   cargo run --bin castline-signal -- --port 8443 --cert cert.pem --key key.pem --token ...

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};

use castline::network::SignalingServer;

/// Rendezvous server for castline peers
#[derive(Parser, Debug)]
#[command(name = "castline-signal")]
#[command(about = "Rendezvous server for castline peers")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Registered user as USERNAME=TOKEN (repeatable)
    #[arg(short, long = "token", value_parser = parse_registration)]
    tokens: Vec<(String, String)>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_registration(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((user, token)) if !user.is_empty() && !token.is_empty() => {
            Ok((user.to_string(), token.to_string()))
        }
        _ => Err(format!("expected USERNAME=TOKEN, got '{}'", s)),
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(anyhow!("No private key found in {}", path.display()))
}

fn create_tls_acceptor(cert_path: &PathBuf, key_path: &PathBuf) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn run_tls_server(
    listener: TcpListener,
    server: SignalingServer,
    acceptor: TlsAcceptor,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        info!("New signaling connection from {}", peer_addr);
        let acceptor = acceptor.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };
            if let Err(e) = server.serve_connection(tls_stream).await {
                warn!("Connection error: {}", e);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;

    if args.tokens.is_empty() {
        warn!("No users registered; every bind will be rejected");
    }
    let tokens: HashMap<String, String> = args
        .tokens
        .into_iter()
        .map(|(user, token)| (token, user))
        .collect();

    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(create_tls_acceptor(cert, key)?),
        (Some(_), None) | (None, Some(_)) => {
            bail!("Both --cert and --key must be provided for TLS")
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    let listener = TcpListener::bind(addr).await?;
    let server = SignalingServer::new(tokens);

    match tls_acceptor {
        Some(acceptor) => {
            info!("Signaling server (wss) listening on {}", listener.local_addr()?);
            run_tls_server(listener, server, acceptor).await
        }
        None => Ok(server.run(listener).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registration() {
        assert_eq!(
            parse_registration("alice=s3cret").unwrap(),
            ("alice".to_string(), "s3cret".to_string())
        );
        assert_eq!(
            parse_registration("bob=a=b").unwrap(),
            ("bob".to_string(), "a=b".to_string())
        );
        assert!(parse_registration("alice").is_err());
        assert!(parse_registration("=token").is_err());
        assert!(parse_registration("alice=").is_err());
    }
}
