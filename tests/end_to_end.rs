mod common;

use common::{drive, idle, wait_until};
use rpcbridge::{
    frame::{self, MessageKind, RequestHeader, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN},
    Args, Client, ClientError, Value,
};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

fn remote_kind(err: ClientError) -> String {
    match err {
        ClientError::Remote { kind, .. } => kind,
        other => panic!("expected a remote error, got {other}"),
    }
}

#[tokio::test]
async fn greeting_carries_increasing_connection_ids() {
    let mut server = common::server().await;

    let first = Client::connect(server.local_addr()).await.unwrap();
    let second = Client::connect(server.local_addr()).await.unwrap();
    assert_eq!(first.connection_id(), 1);
    assert_eq!(second.connection_id(), 2);
    assert_eq!(server.live_connections(), 2);

    drop(first);
    wait_until(&mut server, |server| server.live_connections() == 1).await;

    let third = Client::connect(server.local_addr()).await.unwrap();
    assert_eq!(third.connection_id(), 3);
}

#[tokio::test]
async fn greeting_layout_on_the_wire() {
    let server = common::server().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();

    let mut greeting = [0u8; RESPONSE_HEADER_LEN];
    sock.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn add_returns_the_sum() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let args = Value::args([("a", 2), ("b", 3)]);
    let reply = drive(&mut server, client.call_raw("add", &args)).await.unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.outcome().unwrap().value(), Value::Int(5));

    let args = Value::args([("a", 0.5), ("b", 2.0)]);
    let value = drive(&mut server, client.call("sub", &args)).await.unwrap();
    assert_eq!(value, Value::Float(-1.5));
}

#[tokio::test]
async fn flat_object_payloads_are_accepted() {
    let mut server = common::server().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();
    let greeting = frame::read_response(&mut sock, 1024).await.unwrap();
    let connection_id = greeting.header.connection_id;

    frame::write_request(&mut sock, 7, "add", br#"{"a": 2, "b": "3"}"#).await.unwrap();
    let reply = drive(&mut server, frame::read_response(&mut sock, 1024)).await.unwrap();

    assert_eq!(reply.header.connection_id, connection_id);
    assert_eq!(reply.header.kind, MessageKind::Return);
    assert_eq!(reply.header.status_or_callback_id, frame::STATUS_OK);
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(body, serde_json::json!({ "result": "5" }));
}

#[tokio::test]
async fn key_value_payloads_may_carry_numbers() {
    let mut server = common::server().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();
    frame::read_response(&mut sock, 1024).await.unwrap();

    let payload = br#"{"keys": ["a", "b"], "values": [2, 3]}"#;
    frame::write_request(&mut sock, 1, "add", payload).await.unwrap();
    let reply = drive(&mut server, frame::read_response(&mut sock, 1024)).await.unwrap();

    assert_eq!(reply.header.status_or_callback_id, frame::STATUS_OK);
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(body, serde_json::json!({ "result": "5" }));
}

#[tokio::test]
async fn unknown_function_reports_status_one() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let reply = drive(&mut server, client.call_raw("nope", &Args::new())).await.unwrap();
    assert_eq!(reply.status, frame::STATUS_ERROR);
    let outcome = reply.outcome().unwrap();
    assert_eq!(outcome.error.as_deref(), Some("unknown_function"));
    assert!(outcome.text.contains("nope"));
}

#[tokio::test]
async fn missing_argument_is_an_error() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let args = Value::args([("a", 2)]);
    let err = drive(&mut server, client.call("add", &args)).await.unwrap_err();
    assert_eq!(remote_kind(err), "missing_argument");
    assert!(server.handles().is_empty());
}

#[tokio::test]
async fn handler_errors_reach_the_client() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let args = Value::args([("reason", "out of cheese")]);
    match drive(&mut server, client.call("fail", &args)).await.unwrap_err() {
        ClientError::Remote { function, kind, message } => {
            assert_eq!(function, "fail");
            assert_eq!(kind, "handler_error");
            assert!(message.contains("out of cheese"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn panicking_handlers_do_not_take_the_server_down() {
    let mut server = common::server().await;
    server.register_fn("explode", &[], |_cx, (): ()| -> Result<(), _> {
        panic!("kaboom")
    });
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let err = drive(&mut server, client.call("explode", &Args::new())).await.unwrap_err();
    assert_eq!(remote_kind(err), "handler_error");

    let value = drive(&mut server, client.call("echo", &Value::args([("text", "still here")])))
        .await
        .unwrap();
    assert_eq!(value, Value::from("still here"));
}

#[tokio::test]
async fn work_completes_through_an_allocated_callback() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let first = drive(&mut server, client.allocate_callback()).await.unwrap();
    let second = drive(&mut server, client.allocate_callback()).await.unwrap();
    assert_eq!((first, second), (0, 1));

    let args = Value::args([("input", Value::from("job")), ("onComplete", Value::from(second))]);
    let triggered = drive(&mut server, client.call("do_work", &args)).await.unwrap();
    assert_eq!(triggered, Value::Bool(true));

    let callback = drive(&mut server, client.next_callback()).await.unwrap();
    assert_eq!(callback.callback_id, second);
    assert_eq!(callback.args, Value::args([("result", "done: job")]));
}

#[tokio::test]
async fn host_triggers_reach_only_the_owner() {
    let mut server = common::server().await;
    let mut owner = Client::connect(server.local_addr()).await.unwrap();
    let mut other = Client::connect(server.local_addr()).await.unwrap();

    let id = drive(&mut server, owner.allocate_callback()).await.unwrap();
    assert!(server.trigger_callback(id, &Value::args([("text", "hi")])));

    let callback = drive(&mut server, owner.next_callback()).await.unwrap();
    assert_eq!(callback.callback_id, id);
    assert_eq!(callback.args.get("text"), Some(&Value::from("hi")));

    idle(&mut server, Duration::from_millis(20)).await;
    assert!(other.try_next_callback().is_none());
}

#[tokio::test]
async fn triggering_after_disconnect_is_a_no_op() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();
    let id = drive(&mut server, client.allocate_callback()).await.unwrap();
    drop(client);
    wait_until(&mut server, |server| server.live_connections() == 0).await;

    assert!(!server.trigger_callback(id, &Value::args([("text", "anyone?")])));
    assert!(!server.trigger_callback(id + 100, &Args::new()));
}

#[tokio::test]
async fn timers_fire_until_disposed() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let callback = drive(&mut server, client.allocate_callback()).await.unwrap();
    let args = Value::args([("interval", 10), ("callback", callback)]);
    let handle = match drive(&mut server, client.call("timer", &args)).await.unwrap() {
        Value::Int(handle) => handle,
        other => panic!("expected a handle, got {other:?}"),
    };
    assert!(handle >= 1);

    for _ in 0..2 {
        let tick = drive(&mut server, client.next_callback()).await.unwrap();
        assert_eq!(tick.callback_id, callback);
        assert_eq!(tick.args.get("tick"), Some(&Value::from("true")));
    }

    let args = Value::args([("timerHandle", handle)]);
    let disposed = drive(&mut server, client.call("dispose_timer", &args)).await.unwrap();
    assert_eq!(disposed, Value::Bool(true));
    assert!(server.handles().get_object(handle as i32).is_none());

    while client.try_next_callback().is_some() {}
    idle(&mut server, Duration::from_millis(60)).await;
    assert!(client.try_next_callback().is_none());

    let again = drive(&mut server, client.call("dispose_timer", &args)).await.unwrap();
    assert_eq!(again, Value::Bool(false));
}

#[tokio::test]
async fn zero_interval_timers_are_refused() {
    let mut server = common::server().await;
    let mut client = Client::connect(server.local_addr()).await.unwrap();

    let callback = drive(&mut server, client.allocate_callback()).await.unwrap();
    let args = Value::args([("interval", 0), ("callback", callback)]);
    match drive(&mut server, client.call("timer", &args)).await.unwrap_err() {
        ClientError::Remote { kind, message, .. } => {
            assert_eq!(kind, "handler_error");
            assert!(message.contains("non-zero"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(server.handles().is_empty());
}

#[tokio::test]
async fn malformed_headers_close_the_connection() {
    let mut server = common::server().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();
    frame::read_response(&mut sock, 1024).await.unwrap();

    let mut header = RequestHeader {
        request_id: 0,
        function_name: "add".into(),
        payload_len: 0,
    }
    .encode();
    header[REQUEST_HEADER_LEN - 4..].copy_from_slice(&(-5i32).to_le_bytes());
    sock.write_all(&header).await.unwrap();

    let mut rest = Vec::new();
    let read = drive(&mut server, sock.read_to_end(&mut rest)).await;
    assert!(matches!(read, Ok(0) | Err(_)));
    wait_until(&mut server, |server| server.live_connections() == 0).await;
}

#[tokio::test]
async fn malformed_payloads_are_reported_not_fatal() {
    let mut server = common::server().await;
    let mut sock = TcpStream::connect(server.local_addr()).await.unwrap();
    frame::read_response(&mut sock, 1024).await.unwrap();

    frame::write_request(&mut sock, 1, "add", b"[1, 2]").await.unwrap();
    let reply = drive(&mut server, frame::read_response(&mut sock, 1024)).await.unwrap();
    assert_eq!(reply.header.status_or_callback_id, frame::STATUS_ERROR);

    frame::write_request(&mut sock, 2, "echo", br#"{"text": "fine"}"#).await.unwrap();
    let reply = drive(&mut server, frame::read_response(&mut sock, 1024)).await.unwrap();
    assert_eq!(reply.header.status_or_callback_id, frame::STATUS_OK);
}
