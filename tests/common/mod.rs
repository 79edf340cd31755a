//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::TcpListener;

use host_router::config::{OriginPolicy, RouterConfig};
use host_router::dispatch::WorkDispatcher;
use host_router::http::{HttpServer, RequestPipeline, SessionRegistry};
use host_router::lifecycle::Shutdown;
use host_router::routing::EndpointRegistry;

/// A running router with its dispatcher ticking on a dedicated owning thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<EndpointRegistry>,
    pub dispatcher: Arc<WorkDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: Arc<Shutdown>,
    owner: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}

/// Config tuned for tests: fast ticks, short sync timeout.
pub fn test_config(origin_policy: OriginPolicy) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.dispatch.tick_interval_ms = 1;
    config.dispatch.sync_timeout_ms = 2_000;
    config.websocket.origin_policy = origin_policy;
    config
}

/// Start a server on an ephemeral port. Must be called inside a Tokio runtime.
pub async fn start_server(config: RouterConfig) -> TestServer {
    start_server_with(config, |pipeline| pipeline).await
}

/// Like [`start_server`], letting the caller adjust the request pipeline.
pub async fn start_server_with<F>(config: RouterConfig, customize: F) -> TestServer
where
    F: FnOnce(RequestPipeline) -> RequestPipeline,
{
    let registry = Arc::new(EndpointRegistry::new());
    let dispatcher = Arc::new(WorkDispatcher::new(config.dispatch.clone()));
    let shutdown = Arc::new(Shutdown::new());

    let owner = {
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("test-owner".to_string())
            .spawn(move || {
                dispatcher.run_until(&shutdown).unwrap();
            })
            .unwrap()
    };

    let pipeline = customize(RequestPipeline::from_config(Arc::clone(&registry), &config));
    let server = HttpServer::new(config.clone(), pipeline, Arc::clone(&shutdown));
    let sessions = server.sessions();

    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run(listener));

    TestServer {
        addr,
        registry,
        dispatcher,
        sessions,
        shutdown,
        owner: Some(owner),
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
