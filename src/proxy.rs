use crate::config::{parse_backend_url, Config};
use crate::error::{json_error_response, ProxyErrorCode, ResponseBody};
use crate::pool::{strip_hop_by_hop, ConnectionPool, PoolConfig};
use crate::static_files::StaticFiles;
use http::uri::{Authority, Scheme};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Where forwarded requests go
#[derive(Debug, Clone)]
pub struct BackendTarget {
    scheme: Scheme,
    authority: Authority,
    /// Path component of the base URL without a trailing slash
    base_path: String,
}

impl BackendTarget {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let uri = parse_backend_url(url).map_err(|e| anyhow::anyhow!(e))?;
        let parts = uri.into_parts();
        let scheme = parts.scheme.unwrap_or(Scheme::HTTP);
        let authority = parts
            .authority
            .ok_or_else(|| anyhow::anyhow!("backend URL '{}' has no host", url))?;
        let base_path = parts
            .path_and_query
            .map(|pq| pq.path().trim_end_matches('/').to_string())
            .unwrap_or_default();

        Ok(Self {
            scheme,
            authority,
            base_path,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Join the base URL with an already prefixed path and optional query
    pub fn uri_for(&self, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
        let mut path_and_query = format!("{}{}", self.base_path, path);
        if !path_and_query.starts_with('/') {
            path_and_query.insert(0, '/');
        }
        if let Some(query) = query {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

/// Relays requests under a path prefix to the backend
pub struct Forwarder {
    prefix: String,
    strip_prefix: bool,
    target: BackendTarget,
    backend_url: String,
    request_timeout: Option<Duration>,
    pool: Arc<ConnectionPool>,
}

impl Forwarder {
    pub fn new(
        prefix: impl Into<String>,
        backend_url: &str,
        pool_config: PoolConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            prefix: prefix.into(),
            strip_prefix: false,
            target: BackendTarget::parse(backend_url)?,
            backend_url: backend_url.to_string(),
            request_timeout: None,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        })
    }

    /// Remove the prefix from forwarded paths
    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    /// Bound each forwarded request
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// True for the prefix itself and anything below it, `/apix` does not match `/api`
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path sent to the backend for an inbound path
    pub fn backend_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_prefix {
            return path;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }

    /// Forward one request and relay the backend's answer.
    ///
    /// Connection-level failures are turned into a 500 JSON response, never
    /// into an error for the connection task.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Response<ResponseBody> {
        let uri = match self
            .target
            .uri_for(self.backend_path(req.uri().path()), req.uri().query())
        {
            Ok(uri) => uri,
            Err(e) => {
                error!(request_id, uri = %req.uri(), error = %e, "Failed to build backend URI");
                return json_error_response(
                    ProxyErrorCode::InvalidRequest,
                    "Request path cannot be forwarded",
                );
            }
        };

        let (parts, body) = req.into_parts();

        let body = if carries_body(&parts.method) {
            match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    error!(request_id, error = %e, "Failed to read request body");
                    return json_error_response(
                        ProxyErrorCode::InvalidRequest,
                        "Failed to read request body",
                    );
                }
            }
        } else {
            Bytes::new()
        };

        let mut headers = parts.headers;
        let original_host = headers.get(HOST).cloned();
        strip_hop_by_hop(&mut headers);
        // Host is filled in by the client from the target URI
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        // Overwrite rather than append: this process is the first trusted hop
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        let method = parts.method;
        debug!(request_id, %method, backend_uri = %uri, body_bytes = body.len(), "Forwarding request");

        let mut outbound = Request::new(Full::new(body));
        *outbound.method_mut() = method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;

        match self.pool.send(outbound, self.request_timeout).await {
            Ok(response) => {
                debug!(request_id, %method, status = %response.status(), "Backend responded");
                response
            }
            Err(e) => {
                // Log detail internally, keep the caller-facing message generic
                error!(
                    request_id,
                    %method,
                    backend = %self.backend_url,
                    error = %e,
                    "Proxy error"
                );
                json_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    format!(
                        "Please ensure the backend is running at {}",
                        self.target.authority()
                    ),
                )
            }
        }
    }
}

/// GET and HEAD never carry a forwarded body
pub fn carries_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

/// Routes a request either to the backend or to the static bundle
pub struct Router {
    forwarder: Forwarder,
    static_files: StaticFiles,
}

impl Router {
    pub fn new(forwarder: Forwarder, static_files: StaticFiles) -> Self {
        Self {
            forwarder,
            static_files,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.proxy.pool_max_idle_per_host,
            idle_timeout: config.proxy.pool_idle_timeout(),
        };

        let forwarder = Forwarder::new(&config.proxy.prefix, &config.proxy.backend_url, pool_config)?
            .with_strip_prefix(config.proxy.strip_prefix)
            .with_request_timeout(config.proxy.request_timeout());

        let static_files = StaticFiles::new(&config.server.static_dir, &config.server.index_file);

        Ok(Self::new(forwarder, static_files))
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        if self.forwarder.matches(req.uri().path()) {
            return self.forwarder.forward(req, client_addr, &request_id).await;
        }

        match req.method() {
            &Method::GET => self.static_files.serve(req.uri().path(), false).await,
            &Method::HEAD => self.static_files.serve(req.uri().path(), true).await,
            _ => json_error_response(
                ProxyErrorCode::MethodNotAllowed,
                format!("{} is not supported for static content", req.method()),
            ),
        }
    }
}

/// The front-end HTTP server
pub struct ProxyServer {
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(router: Router, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            router: Arc::new(router),
            shutdown_rx,
        }
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.router.forwarder().pool().stats();
        info!(
            forwarded = stats.get_total_requests(),
            failed = stats.get_failed_requests(),
            "Proxy statistics"
        );

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(prefix: &str, url: &str) -> Forwarder {
        Forwarder::new(prefix, url, PoolConfig::default()).unwrap()
    }

    #[test]
    fn test_prefix_matching() {
        let fwd = forwarder("/api", "http://localhost:8001");
        assert!(fwd.matches("/api"));
        assert!(fwd.matches("/api/"));
        assert!(fwd.matches("/api/health"));
        assert!(fwd.matches("/api/conversations/42/message"));
        assert!(!fwd.matches("/apix"));
        assert!(!fwd.matches("/"));
        assert!(!fwd.matches("/dashboard/api"));
    }

    #[test]
    fn test_backend_path_preserved_by_default() {
        let fwd = forwarder("/api", "http://localhost:8001");
        assert_eq!(fwd.backend_path("/api/health"), "/api/health");
    }

    #[test]
    fn test_backend_path_stripped() {
        let fwd = forwarder("/api", "http://localhost:8001").with_strip_prefix(true);
        assert_eq!(fwd.backend_path("/api/health"), "/health");
        assert_eq!(fwd.backend_path("/api"), "/");
        assert_eq!(fwd.backend_path("/api/"), "/");
    }

    #[test]
    fn test_target_uri() {
        let target = BackendTarget::parse("http://localhost:8001").unwrap();
        assert_eq!(
            target.uri_for("/api/health", None).unwrap(),
            "http://localhost:8001/api/health"
        );
        assert_eq!(
            target.uri_for("/api/search", Some("q=rust&page=2")).unwrap(),
            "http://localhost:8001/api/search?q=rust&page=2"
        );
    }

    #[test]
    fn test_target_uri_with_base_path() {
        let target = BackendTarget::parse("http://10.0.0.5:9000/v1/").unwrap();
        assert_eq!(target.authority().as_str(), "10.0.0.5:9000");
        assert_eq!(
            target.uri_for("/api/health", None).unwrap(),
            "http://10.0.0.5:9000/v1/api/health"
        );
    }

    #[test]
    fn test_invalid_backend_url() {
        assert!(Forwarder::new("/api", "ftp://localhost", PoolConfig::default()).is_err());
        assert!(Forwarder::new("/api", "not a url", PoolConfig::default()).is_err());
    }

    #[test]
    fn test_carries_body() {
        assert!(!carries_body(&Method::GET));
        assert!(!carries_body(&Method::HEAD));
        assert!(carries_body(&Method::POST));
        assert!(carries_body(&Method::PUT));
        assert!(carries_body(&Method::PATCH));
        assert!(carries_body(&Method::DELETE));
    }
}
