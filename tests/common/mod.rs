#![allow(dead_code)]

use rpcbridge::{HandlerError, Resource, Server, ServerConfig, Value};
use std::{future::Future, time::Duration};

/// Polls `fut` while draining the server every millisecond, the way a host
/// loop would call `process_pending` once per tick.
pub async fn drive<F: Future>(server: &mut Server, fut: F) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = tokio::time::sleep(Duration::from_millis(1)) => {
                server.process_pending();
            }
        }
    }
}

/// Drains the server for `period` without anything else to wait on.
pub async fn idle(server: &mut Server, period: Duration) {
    drive(server, tokio::time::sleep(period)).await;
}

/// Drains the server until `done` holds, giving up after five seconds.
pub async fn wait_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
    for _ in 0..5000 {
        if done(server) {
            return;
        }
        idle(server, Duration::from_millis(1)).await;
    }
    panic!("server never reached the expected state");
}

pub async fn server() -> Server {
    let mut server = Server::bind(ServerConfig::ephemeral()).await.unwrap();

    server.register_fn("add", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a + b));
    server.register_fn("sub", &["a", "b"], |_cx, (a, b): (f64, f64)| Ok(a - b));
    server.register_fn("echo", &["text"], |_cx, (text,): (String,)| Ok(text));
    server.register_fn("fail", &["reason"], |_cx, (reason,): (String,)| {
        Err::<(), _>(HandlerError::new(reason))
    });

    // Runs the work immediately and reports through the client's callback.
    server.register_fn(
        "do_work",
        &["input", "onComplete"],
        |cx, (input, on_complete): (String, i32)| {
            let args = Value::args([("result", format!("done: {input}"))]);
            Ok(cx.trigger_callback(on_complete, &args))
        },
    );

    server.register_fn("timer", &["interval", "callback"], |cx, (interval, callback): (i64, i32)| {
        let period = Duration::from_millis(u64::try_from(interval).unwrap_or(0));
        let timer = cx.start_timer(period, callback, Value::args([("tick", true)]))?;
        Ok(cx.handles().add_handle(Resource::Timer(timer)))
    });

    server.register_fn("dispose_timer", &["timerHandle"], |cx, (handle,): (i32,)| {
        match cx.handles().get_timer(handle) {
            Some(timer) => timer.dispose(),
            None => return Ok(false),
        }
        Ok(cx.handles().remove_handle(handle))
    });

    server
}
