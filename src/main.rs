//! host-router demo host.
//!
//! Runs the HTTP server on a background Tokio runtime while the main thread
//! plays the host: it owns some state and drives the work dispatcher.

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use host_router::config::{load_config, RouterConfig};
use host_router::dispatch::WorkDispatcher;
use host_router::error::ServerError;
use host_router::http::websocket::Frame;
use host_router::http::{HttpServer, RequestContext, RequestPipeline};
use host_router::lifecycle::{signals, Shutdown};
use host_router::observability::{logging, metrics};
use host_router::routing::{EndpointRegistry, RouteTable};

#[derive(Parser)]
#[command(name = "host-router")]
#[command(about = "Embedded HTTP/WebSocket router demo host", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

thread_local! {
    // Host state: only ever touched on the owning thread.
    static VISITS: Cell<u64> = const { Cell::new(0) };
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!("host-router v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_workloads_per_tick = config.dispatch.max_workloads_per_tick,
        origin_policy = ?config.websocket.origin_policy,
        "Configuration loaded"
    );

    let dispatcher = Arc::new(WorkDispatcher::new(config.dispatch.clone()));
    dispatcher.bind_owning_thread()?;

    let shutdown = Arc::new(Shutdown::new());
    let registry = Arc::new(EndpointRegistry::new());
    let pipeline = RequestPipeline::from_config(Arc::clone(&registry), &config);
    let server = HttpServer::new(config.clone(), pipeline, Arc::clone(&shutdown));

    install_demo_routes(&registry, &server, &dispatcher)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let server_shutdown = Arc::clone(&shutdown);
    let server_thread = std::thread::Builder::new()
        .name("host-router-net".to_string())
        .spawn(move || {
            let result = runtime.block_on(serve(config, server, Arc::clone(&server_shutdown)));
            // Stop the owning-thread loop if the server exits on its own.
            server_shutdown.trigger();
            result
        })?;

    dispatcher.run_until(&shutdown)?;

    match server_thread.join() {
        Ok(result) => result?,
        Err(_) => tracing::error!("Server thread panicked"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve(
    config: RouterConfig,
    server: HttpServer,
    shutdown: Arc<Shutdown>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.listener.bind_address.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(address = %local_addr, "Listening for connections");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    tokio::spawn(signals::wait_for_ctrl_c(shutdown));
    server.run(listener).await
}

fn install_demo_routes(
    registry: &Arc<EndpointRegistry>,
    server: &HttpServer,
    dispatcher: &Arc<WorkDispatcher>,
) -> Result<(), Box<dyn std::error::Error>> {
    let echo_ws = registry.register_websocket_endpoint(
        "/ws/echo",
        Arc::new(|frame: Frame| {
            if let Some(text) = frame.text() {
                frame.session().send_text(text);
            }
            Ok(())
        }),
        None,
    )?;

    let visits = Arc::clone(dispatcher);
    let sessions = server.sessions();

    let installed = RouteTable::new()
        .get("/echo/{word}", |ctx: &mut RequestContext| {
            let word = ctx.path_param("word").unwrap_or_default().to_string();
            ctx.create_response().text(word).send();
            Ok(())
        })
        .label("echo")
        .get("/visits", move |ctx: &mut RequestContext| {
            let count = visits.execute_sync(|| {
                Ok(VISITS.with(|v| {
                    v.set(v.get() + 1);
                    v.get()
                }))
            })?;
            ctx.create_response()
                .json(&serde_json::json!({ "visits": count }))?
                .send();
            Ok(())
        })
        .label("visits")
        .post("/broadcast", move |ctx: &mut RequestContext| {
            let reached = sessions.broadcast(echo_ws, ctx.body_text());
            ctx.create_response()
                .json(&serde_json::json!({ "reached": reached }))?
                .send();
            Ok(())
        })
        .label("broadcast")
        .install(registry)?;

    tracing::info!(
        tag = %installed.tag(),
        routes = installed.endpoints().len(),
        websocket = %echo_ws,
        "Demo routes installed"
    );
    Ok(())
}
