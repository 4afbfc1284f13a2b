#![allow(dead_code)]

use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use mitm_rust_proxy::config::Config;
use mitm_rust_proxy::engine::MitmEngine;
use mitm_rust_proxy::proxy::Proxy;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct TestProxy {
    pub addr: SocketAddr,
    pub engine: Arc<MitmEngine>,
    pub ca_pem: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn start_proxy(mut config: Config, setup: impl FnOnce(&Proxy)) -> TestProxy {
    config.proxy.host = "127.0.0.1".to_string();
    config.proxy.port = 0;

    let proxy = Proxy::new(config).unwrap();
    setup(&proxy);
    let ca_pem = proxy.ca_cert_pem().to_string();

    let bound = proxy.bind().await.unwrap();
    let addr = bound.local_addr();
    let engine = bound.engine().clone();

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        bound
            .serve(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestProxy {
        addr,
        engine,
        ca_pem,
        shutdown: Some(tx),
    }
}

pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Echo service: answers `echo:<body>` and reports what it received in
/// `x-seen-*` headers. Requests asking for an upgrade get a `101` and a
/// byte echo on the upgraded connection.
async fn echo_service(
    mut req: Request<Incoming>,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    hits.fetch_add(1, Ordering::SeqCst);

    if req.headers().contains_key(UPGRADE) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = on_upgrade.await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 1024];
                while let Ok(n) = io.read(&mut buf).await {
                    if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("echo"));
        return Ok(response);
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mitm = req
        .headers()
        .get("x-mitm")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let names = req
        .headers()
        .keys()
        .map(|name| name.as_str().to_string())
        .collect::<Vec<_>>()
        .join(",");

    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let mut payload = b"echo:".to_vec();
    payload.extend_from_slice(&body);

    let mut response = Response::new(Full::new(Bytes::from(payload)));
    let headers = response.headers_mut();
    headers.insert("x-seen-path", HeaderValue::from_str(&path).unwrap());
    headers.insert("x-seen-host", HeaderValue::from_str(&host).unwrap());
    headers.insert("x-seen-mitm", HeaderValue::from_str(&mitm).unwrap());
    headers.insert("x-seen-headers", HeaderValue::from_str(&names).unwrap());
    Ok(response)
}

async fn serve_echo<I>(io: I, hits: Arc<AtomicUsize>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| echo_service(req, hits.clone()));
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await;
}

pub async fn start_plain_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_echo(stream, server_hits.clone()));
        }
    });

    Upstream { addr, hits }
}

pub async fn start_tls_upstream() -> Upstream {
    let certified = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let hits = server_hits.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_echo(tls, hits).await;
                }
            });
        }
    });

    Upstream { addr, hits }
}

/// Raw TCP echo, for tunnels that are never terminated.
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Read a response head byte by byte so nothing after it is consumed.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "connection closed before the response head ended");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Open a CONNECT tunnel through the proxy and return the raw stream.
pub async fn connect_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT answer: {head}");
    stream
}

/// TLS over an open tunnel, trusting only the proxy's root.
pub async fn tls_over(stream: TcpStream, ca_pem: &str, host: &str) -> TlsStream<TcpStream> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string()).unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .unwrap()
}

pub async fn http1_client<I>(io: I) -> SendRequest<Full<Bytes>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.with_upgrades().await;
    });
    sender
}

/// Client speaking HTTPS to `upstream` through a terminated tunnel.
pub async fn intercepted_client(proxy: &TestProxy, upstream: SocketAddr) -> SendRequest<Full<Bytes>> {
    let tunnel = connect_tunnel(proxy.addr, upstream).await;
    let tls = tls_over(tunnel, &proxy.ca_pem, &upstream.ip().to_string()).await;
    http1_client(tls).await
}

pub async fn body_string(response: Response<Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn header<'a>(response: &'a Response<Incoming>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}
