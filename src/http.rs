use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::egress::viewer::{UriData, Viewer};
use crate::error::Error;
use crate::utils::{app_dir, query_value};
use crate::StreamerInner;

const INIT_TRY_MAX: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REQUEST_HEAD: usize = 8192;

/// A client connection, plaintext or TLS. Once transferred to a viewer the
/// server side never reads or writes it again.
pub(crate) enum HttpConnection {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl HttpConnection {
    fn stream(&self) -> &TcpStream {
        match self {
            HttpConnection::Plain(s) => s,
            HttpConnection::Tls(t) => t.get_ref(),
        }
    }

    pub fn peer_string(&self) -> String {
        self.stream()
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    /// Switches the socket to blocking long-write mode for streaming.
    pub fn set_stream_mode(&self) -> std::io::Result<()> {
        let s = self.stream();
        s.set_nonblocking(false)?;
        s.set_read_timeout(None)?;
        s.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            HttpConnection::Plain(s) => s.write_all(data),
            HttpConnection::Tls(t) => t.write_all(data),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            HttpConnection::Plain(s) => s.read(buf),
            HttpConnection::Tls(t) => t.read(buf),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stream().shutdown(Shutdown::Both);
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    }
}

fn send_error(conn: &mut HttpConnection, status: u16) {
    let head = format!(
        "HTTP/1.1 {} {}\r\nServer: lxstreamer/1.1\r\nConnection: Close\r\nContent-Length: 0\r\n\r\n",
        status,
        status_reason(status)
    );
    let _ = conn.write_all(head.as_bytes());
    conn.shutdown();
}

/// Spawns the server thread accepting stream clients.
pub(crate) fn start(inner: Arc<StreamerInner>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("http-server".to_string())
        .spawn(move || serve(inner))
        .expect("spawn http server")
}

fn serve(inner: Arc<StreamerInner>) {
    let tls = if inner.https {
        match build_tls_config(&inner) {
            Some(cfg) => Some(Arc::new(cfg)),
            None => return,
        }
    } else {
        None
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], inner.port));
    let mut listener = None;
    for _ in 0..INIT_TRY_MAX {
        match TcpListener::bind(addr) {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(_) => std::thread::sleep(POLL_INTERVAL),
        }
    }
    let Some(listener) = listener else {
        error!("http server: failed to listen on port: {}", inner.port);
        return;
    };
    if listener.set_nonblocking(true).is_err() {
        error!("http server: failed to configure listener");
        return;
    }

    if inner.https {
        // self-probe confirms the TLS listener actually answers
        match TcpStream::connect_timeout(
            &SocketAddr::from(([127, 0, 0, 1], inner.port)),
            Duration::from_secs(2),
        ) {
            Ok(_) => info!("https server listening on port: {}", inner.port),
            Err(e) => warn!("https server self probe failed: {}", e),
        }
    } else {
        info!("http server listening on port: {}", inner.port);
    }

    while inner.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let inner = inner.clone();
                let tls = tls.clone();
                std::thread::spawn(move || handle_connection(stream, inner, tls));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("http server: accept failed: {}", e);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
    info!("http server finished");
}

/// Resolves cert/key paths: configured values first, `server.pem` /
/// `server.key` defaults, relative names re-rooted at the app directory.
fn resolve_ssl_paths(inner: &StreamerInner) -> (PathBuf, PathBuf) {
    let (cert, key) = inner.ssl_paths.lock().clone();
    let cert = if cert.is_empty() {
        "server.pem".to_string()
    } else {
        cert
    };
    let key = if key.is_empty() {
        "server.key".to_string()
    } else {
        key
    };
    let resolve = |p: String| -> PathBuf {
        let path = PathBuf::from(&p);
        if path.exists() {
            path.canonicalize().unwrap_or(path)
        } else if let Some(name) = path.file_name() {
            app_dir().join(name)
        } else {
            path
        }
    };
    (resolve(cert), resolve(key))
}

fn build_tls_config(inner: &StreamerInner) -> Option<ServerConfig> {
    let (cert_path, key_path) = resolve_ssl_paths(inner);
    let certs = match std::fs::File::open(&cert_path) {
        Ok(f) => {
            let certs: std::result::Result<Vec<_>, _> =
                rustls_pemfile::certs(&mut BufReader::new(f)).collect();
            match certs {
                Ok(c) if !c.is_empty() => c,
                _ => {
                    error!(
                        "http server: invalid ssl certificate: {}",
                        cert_path.display()
                    );
                    return None;
                }
            }
        }
        Err(e) => {
            error!(
                "http server: failed to read ssl certificate: {} err: {}",
                cert_path.display(),
                e
            );
            return None;
        }
    };
    let key = match std::fs::File::open(&key_path) {
        Ok(f) => match rustls_pemfile::private_key(&mut BufReader::new(f)) {
            Ok(Some(k)) => k,
            _ => {
                error!("http server: invalid ssl key: {}", key_path.display());
                return None;
            }
        },
        Err(e) => {
            error!(
                "http server: failed to read ssl key: {} err: {}",
                key_path.display(),
                e
            );
            return None;
        }
    };
    match ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
    {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!("http server: failed to build tls config: {}", e);
            None
        }
    }
}

fn handle_connection(stream: TcpStream, inner: Arc<StreamerInner>, tls: Option<Arc<ServerConfig>>) {
    let _ = stream.set_read_timeout(Some(REQUEST_TIMEOUT));
    let mut conn = match tls {
        Some(cfg) => match ServerConnection::new(cfg) {
            Ok(sc) => HttpConnection::Tls(Box::new(StreamOwned::new(sc, stream))),
            Err(e) => {
                warn!("http server: tls session failed: {}", e);
                return;
            }
        },
        None => HttpConnection::Plain(stream),
    };

    let Some(head) = read_request_head(&mut conn) else {
        conn.shutdown();
        return;
    };
    let Some((method, target)) = parse_request_line(&head) else {
        conn.shutdown();
        return;
    };
    if method != "GET" {
        conn.shutdown();
        return;
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    if path != "/stream" {
        warn!("http server: unknown api: {}", path);
        conn.shutdown();
        return;
    }

    match make_stream(&inner, conn, &path, &query) {
        Ok(()) => {}
        Err((mut conn, e)) => send_error(&mut conn, e.http_status()),
    }
}

fn read_request_head(conn: &mut HttpConnection) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = conn.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_REQUEST_HEAD {
            return None;
        }
    }
    String::from_utf8(head).ok()
}

fn parse_request_line(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    Some((method, target))
}

/// Routes a stream request: find the source, check the session token,
/// transfer the connection into a new viewer.
fn make_stream(
    inner: &StreamerInner,
    conn: HttpConnection,
    path: &str,
    query: &str,
) -> std::result::Result<(), (HttpConnection, Error)> {
    let uri = UriData {
        path: path.to_string(),
        query: query.to_string(),
        source_name: query_value(query, "source"),
        session: query_value(query, "session"),
    };

    let sources = inner.sources.lock();
    let Some(source) = sources.get(&uri.source_name) else {
        return Err((conn, Error::NotFound));
    };
    if uri.session != source.auth_session() {
        return Err((conn, Error::AuthenticationFailed));
    }
    if !source.is_started() {
        return Err((conn, Error::NotReady));
    }

    let viewer = Viewer::new(uri, conn, source.shared.clone())?;
    source.add_viewer(viewer);
    Ok(())
}
