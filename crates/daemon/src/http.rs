use crate::metrics::Metrics;
use anyhow::Result;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Serve `/metrics` and `/health` on `port` until the task is dropped.
pub async fn serve_metrics(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics listening on http://{}/metrics", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, Infallible>(route(&req, &metrics)) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

fn route<B>(req: &Request<B>, metrics: &Metrics) -> Response<String> {
    if *req.method() != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed".into());
    }
    match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            metrics.to_prometheus(),
        ),
        "/health" => {
            let body = serde_json::json!({
                "status": "ok",
                "nat": metrics.nat_type_label(),
                "passes": metrics.reconcile_passes_total.load(Ordering::Relaxed),
            });
            respond(StatusCode::OK, "application/json", body.to_string())
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".into()),
    }
}

fn respond(status: StatusCode, content_type: &str, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new();

        let resp = route(&get("/metrics"), &metrics);
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.body().contains("meshd_reconcile_passes_total"));

        let resp = route(&get("/health"), &metrics);
        assert_eq!(resp.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(health["status"], "ok");

        assert_eq!(route(&get("/nope"), &metrics).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_rejects_non_get() {
        let metrics = Metrics::new();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/metrics")
            .body(())
            .unwrap();
        assert_eq!(route(&req, &metrics).status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
