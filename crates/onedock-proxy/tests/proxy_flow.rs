//! End-to-end proxy behavior against live sockets

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use onedock_proxy::{Backend, BalanceStrategy, LoadBalancer, PortProxy};
use onedock_spec::ContainerMapping;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Minimal upstream answering every request with a fixed body
async fn spawn_upstream(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req| async move {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    port
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn mapping(docker_port: u16) -> ContainerMapping {
    ContainerMapping {
        public_port: 0,
        docker_port,
        container_id: format!("container-{docker_port}"),
        service_name: "web".to_string(),
    }
}

async fn get(port: u16, path: &str) -> (StatusCode, String) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = http::Request::get(format!("http://127.0.0.1:{port}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn test_single_mode_forwards_to_target() {
    let upstream = spawn_upstream("hello from upstream").await;
    let public_port = free_port();

    let proxy = PortProxy::single(public_port, Arc::new(Backend::new(mapping(upstream))));
    proxy.start().await.unwrap();

    let (status, body) = get(public_port, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from upstream");

    proxy.stop().await;
}

#[tokio::test]
async fn test_balanced_mode_distributes_round_robin() {
    let upstream_a = spawn_upstream("a").await;
    let upstream_b = spawn_upstream("b").await;
    let public_port = free_port();

    let backends = vec![
        Arc::new(Backend::new(mapping(upstream_a))),
        Arc::new(Backend::new(mapping(upstream_b))),
    ];
    let proxy = PortProxy::balanced(
        public_port,
        LoadBalancer::new(BalanceStrategy::RoundRobin, backends),
    );
    proxy.start().await.unwrap();

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..4 {
        let (status, body) = get(public_port, "/").await;
        assert_eq!(status, StatusCode::OK);
        *counts.entry(body).or_default() += 1;
    }

    assert_eq!(counts.get("a"), Some(&2));
    assert_eq!(counts.get("b"), Some(&2));

    proxy.stop().await;
}

#[tokio::test]
async fn test_dead_backend_answers_bad_gateway() {
    // A port nothing listens on
    let dead_port = free_port();
    let public_port = free_port();

    let proxy = PortProxy::single(public_port, Arc::new(Backend::new(mapping(dead_port))));
    proxy.start().await.unwrap();

    let (status, body) = get(public_port, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains(&format!("container-{dead_port}")));

    proxy.stop().await;
}

#[tokio::test]
async fn test_no_active_backends_answers_service_unavailable() {
    let public_port = free_port();

    let backend = Arc::new(Backend::new(mapping(free_port())));
    backend.set_active(false);
    let proxy = PortProxy::balanced(
        public_port,
        LoadBalancer::new(BalanceStrategy::RoundRobin, vec![backend]),
    );
    proxy.start().await.unwrap();

    let (status, body) = get(public_port, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("no available backends"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_stopped_proxy_refuses_connections() {
    let upstream = spawn_upstream("up").await;
    let public_port = free_port();

    let proxy = PortProxy::single(public_port, Arc::new(Backend::new(mapping(upstream))));
    proxy.start().await.unwrap();
    let (status, _) = get(public_port, "/").await;
    assert_eq!(status, StatusCode::OK);

    proxy.stop().await;

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = http::Request::get(format!("http://127.0.0.1:{public_port}/"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert!(client.request(request).await.is_err());
}

#[tokio::test]
async fn test_path_and_query_forwarded() {
    // Upstream that echoes the request target
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: http::Request<hyper::body::Incoming>| async move {
                    let target = req.uri().path_and_query().unwrap().to_string();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(target))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    let public_port = free_port();
    let proxy = PortProxy::single(public_port, Arc::new(Backend::new(mapping(upstream))));
    proxy.start().await.unwrap();

    let (status, body) = get(public_port, "/api/items?page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "/api/items?page=2");

    proxy.stop().await;
}
