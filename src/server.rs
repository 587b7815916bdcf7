//! HTTP(S) listeners and the per-request handler.
//!
//! Each configured listener runs its own accept loop; every connection is
//! served on its own task. The compiled ruleset is shared behind one mutex
//! which a request holds for the full match + render, so a hot reload can
//! swap the ruleset but never interleave with a request.

use crate::config::ServerConfig;
use crate::matcher::{find_match, RequestParts};
use crate::render::{render, RenderedBody, RenderedResponse};
use crate::rules::CompiledRule;
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// The live ruleset, swapped wholesale by the reload controller.
pub type SharedRules = Arc<Mutex<Vec<CompiledRule>>>;

/// Bind one listener and serve requests until a fatal I/O error.
pub async fn run_server(server: ServerConfig, rules: SharedRules) -> anyhow::Result<()> {
    let addr = parse_listen_addr(&server.addr)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let tls_acceptor = match (&server.cert_file, &server.key_file) {
        (Some(cert_file), Some(key_file)) => {
            info!(
                addr = %server.addr,
                cert_file = %cert_file,
                key_file = %key_file,
                "HTTPS server listening"
            );
            Some(create_tls_acceptor(cert_file, key_file)?)
        }
        _ => {
            info!(addr = %server.addr, "HTTP server listening");
            None
        }
    };

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let rules = Arc::clone(&rules);
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let rules = Arc::clone(&rules);
                async move { handle_request(req, rules).await }
            });

            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                        {
                            error!(
                                "error serving HTTPS connection from {}: {}",
                                remote_addr, err
                            );
                        }
                    }
                    Err(err) => error!("TLS handshake failed from {}: {}", remote_addr, err),
                },
                None => {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        error!("error serving HTTP connection from {}: {}", remote_addr, err);
                    }
                }
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    rules: SharedRules,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read request body: {err}"),
            ))
        }
    };

    debug!(method = %parts.method, path = %parts.uri.path(), "incoming request");

    let request = RequestParts {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        header_lines: flatten_header_lines(&parts.headers),
        body,
    };

    let guard = rules.lock().await;
    let response = match find_match(&guard, &request) {
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("error in finding matching rule for this request: {err}"),
        ),
        Ok(None) => {
            debug!(method = %request.method, path = %request.path, "no matching rule");
            error_response(
                StatusCode::NOT_FOUND,
                "no matching rule found for this request",
            )
        }
        Ok(Some((rule, env))) => {
            info!(
                rule = %rule.display_name(),
                method = %request.method,
                path = %request.path,
                "request matched rule"
            );
            match render(rule, &env) {
                Ok(rendered) => match write_response(rendered).await {
                    Ok(response) => response,
                    Err(err) => error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("failed to write response: {err}"),
                    ),
                },
                Err(err) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("failed to render response: {err}"),
                ),
            }
        }
    };
    drop(guard);

    Ok(response)
}

async fn write_response(rendered: RenderedResponse) -> anyhow::Result<Response<Full<Bytes>>> {
    let mut builder = Response::builder();
    if let Some(status) = rendered.status {
        builder = builder.status(status);
    }
    for (key, value) in &rendered.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }

    let response = match rendered.body {
        RenderedBody::Empty => builder.body(Full::new(Bytes::new()))?,
        RenderedBody::Json(bytes) => builder.body(Full::new(Bytes::from(bytes)))?,
        RenderedBody::File {
            path,
            size,
            file_name,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read response file {}", path.display()))?;
            builder
                .header(
                    "Content-Disposition",
                    format!("attachment; filename=\"{file_name}\""),
                )
                .header("Content-Length", size.to_string())
                .body(Full::new(Bytes::from(bytes)))?
        }
    };

    Ok(response)
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

/// Flatten request headers to `"Key: Value"` lines, one per value, with the
/// key in canonical casing so header rules can match the conventional
/// spelling regardless of what the client sent.
fn flatten_header_lines(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| {
            format!(
                "{}: {}",
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes())
            )
        })
        .collect()
}

fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Accept `host:port` or bare `:port` meaning all interfaces.
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

/// Build a TLS acceptor from PEM certificate and key files.
fn create_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("failed to open certificate file {cert_path:?}: {e}"))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse certificate file: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {cert_path:?}");
    }

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| anyhow::anyhow!("failed to open private key file {key_path:?}: {e}"))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("failed to parse private key file: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path:?}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("failed to build TLS configuration: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
