//! Headless RPC host.
//!
//! Serves a handful of demo functions until Ctrl-C. Connect with any client
//! that speaks the frame format, or with `rpcbridge::Client`.

use anyhow::Result;
use clap::Parser;
use rpcbridge::{HandlerError, Resource, Server, ServerConfig, Value};
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "headless")]
#[command(about = "Serves demo functions over the RPC bridge")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// JSON config file; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug when set.
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let mut server = Server::bind(config).await?;
    register_demo_functions(&mut server);
    for function in server.functions() {
        info!("serving {}{}", function.name, function.signature);
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.shutdown();
        }
    });

    info!("RPC bridge running on {}", server.local_addr());
    server.wait_for_all_connections().await;
    server.shutdown();
    Ok(())
}

fn register_demo_functions(server: &mut Server) {
    server.register_fn("add", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a + b));
    server.register_fn("sub", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a - b));
    server.register_fn("mul", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a * b));
    server.register_fn("echo", &["text"], |_cx, (text,): (String,)| Ok(text));

    server.register_fn(
        "do_work",
        &["input", "onComplete"],
        |cx, (input, on_complete): (String, i32)| {
            info!(connection = cx.connection_id(), "working on {input:?}");
            let args = Value::args([("result", format!("processed {input}"))]);
            cx.trigger_callback(on_complete, &args);
            Ok(())
        },
    );

    server.register_fn(
        "timer",
        &["intervalMs", "callback"],
        |cx, (interval_ms, callback): (i64, i32)| {
            let period = u64::try_from(interval_ms)
                .map(Duration::from_millis)
                .map_err(|_| HandlerError::new("interval must not be negative"))?;
            let timer = cx.start_timer(period, callback, Value::args([("timer", "tick")]))?;
            Ok(cx.handles().add_handle(Resource::Timer(timer)))
        },
    );

    server.register_fn("dispose_timer", &["timerHandle"], |cx, (handle,): (i32,)| {
        match cx.handles().get_timer(handle) {
            Some(timer) => timer.dispose(),
            None => return Err(format!("no timer with handle {handle}").into()),
        }
        Ok(cx.handles().remove_handle(handle))
    });
}
