//! Minimal static file server speaking the `-S host:port -t root` convention.
//!
//! Used as a stand-in backend when PHP is not installed. GET and HEAD serve
//! files below the document root; any other method echoes the request body.

use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

const SERVER_NAME: &str = "devgate-static";

#[derive(Parser, Debug)]
#[command(name = "devgate-static", version)]
struct Args {
    /// Listen address as host:port
    #[arg(short = 'S')]
    listen: String,

    /// Document root
    #[arg(short = 't', default_value = ".")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate_static=info".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();
    let root = Arc::new(args.root.canonicalize()?);
    let listener = TcpListener::bind(&args.listen).await?;
    info!(addr = %listener.local_addr()?, root = %root.display(), "Static server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let root = Arc::clone(&root);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&root)));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(addr = %addr, error = %e, "Connection error");
            }
        });
    }
}

async fn handle(req: Request<Incoming>, root: Arc<PathBuf>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(method = %method, path = %path, "Request");

    let response = match method {
        Method::GET | Method::HEAD => serve_file(&root, &path, method == Method::HEAD).await,
        _ => match req.into_body().collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                reply(StatusCode::OK, "application/octet-stream", body)
            }
            Err(_) => reply(StatusCode::BAD_REQUEST, "text/plain", Bytes::from_static(b"bad request body")),
        },
    };

    Ok(response)
}

async fn serve_file(root: &Path, request_path: &str, head_only: bool) -> Response<Full<Bytes>> {
    let Some(mut file) = resolve(root, request_path) else {
        return reply(StatusCode::FORBIDDEN, "text/plain", Bytes::from_static(b"forbidden"));
    };

    if file.is_dir() {
        file.push("index.html");
    }

    match tokio::fs::read(&file).await {
        Ok(contents) => {
            let len = contents.len();
            let body = if head_only { Bytes::new() } else { Bytes::from(contents) };
            let mut response = reply(StatusCode::OK, content_type(&file), body);
            response.headers_mut().insert(CONTENT_LENGTH, len.into());
            response
        }
        Err(_) => reply(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"not found")),
    }
}

/// Map a URL path onto the document root, refusing anything that escapes it
fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(request_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

fn reply(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(SERVER, SERVER_NAME.parse().expect("static header value"));
    response.headers_mut().insert(CONTENT_TYPE, content_type.parse().expect("static header value"));
    response
}
