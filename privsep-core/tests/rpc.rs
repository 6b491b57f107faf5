//! End-to-end exercises of the wire/channel/context stack over a real
//! `UnixStream` pair, without going through `bootstrap` or `daemon::run` —
//! those also drop privileges, which these tests do not have (and should
//! not need) to do. Instead each test drives a small request loop built only
//! from public API, standing in for the daemon side of the channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use privsep_core::context::Context;
use privsep_core::logbridge::{LogRecord, LogSink};
use privsep_core::wire::Frame;
use privsep_core::{PrivsepError, RemoteError};
use rmpv::Value;
use tokio::net::UnixStream;

/// Runs the server side of one channel until the client disconnects,
/// dispatching through `context` exactly like `daemon::loop_requests` does,
/// minus the privilege drop and the bounded worker pool.
async fn serve(stream: UnixStream, context: Arc<Context>) {
    let mut channel = privsep_core::channel::ServerChannel::new(stream);
    context.set_client_mode(false);

    loop {
        let (msgid, frame) = match channel.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(_) => return,
        };

        let reply = match frame {
            Frame::Ping => Frame::Pong,
            Frame::Call { name, args, kwargs } => match context.invoke(&name, args, kwargs).await {
                Ok(value) => Frame::Ret { value },
                Err(PrivsepError::Remote {
                    type_identifier,
                    args,
                    ..
                }) => Frame::Err {
                    type_identifier,
                    args,
                },
                Err(other) => Frame::Err {
                    type_identifier: "privsep.InternalError".to_owned(),
                    args: vec![Value::from(other.to_string())],
                },
            },
            other => Frame::Err {
                type_identifier: "privsep.ProtocolError".to_owned(),
                args: vec![Value::from(format!("unexpected frame: {other:?}"))],
            },
        };

        if channel.send(msgid, reply).await.is_err() {
            return;
        }
    }
}

struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl LogSink for RecordingSink {
    fn accept(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[derive(Debug)]
struct QuotaExceeded {
    reason: String,
}

impl std::fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quota exceeded: {}", self.reason)
    }
}

impl RemoteError for QuotaExceeded {
    const TYPE_IDENTIFIER: &'static str = "rpc_tests::QuotaExceeded";

    fn to_args(&self) -> Vec<Value> {
        vec![Value::from(self.reason.as_str())]
    }

    fn render(args: &[Value]) -> String {
        let reason = args.first().and_then(|v| v.as_str()).unwrap_or("?");
        format!("quota exceeded: {reason}")
    }
}

#[tokio::test]
async fn echo_through_helper() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();

    let context = Arc::new(Context::new("rpc_tests::echo", vec![]));
    context
        .entrypoint("rpc_tests::echo::add1", None, |args, _kwargs| {
            let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Value::from(n + 1))
        })
        .unwrap();

    let server = tokio::spawn(serve(server_sock, context.clone()));

    let client = privsep_core::channel::ClientChannel::connect(
        client_sock,
        Arc::new(privsep_core::logbridge::TracingLogSink),
    )
    .await
    .unwrap();

    let result = client
        .remote_call(
            "rpc_tests::echo::add1",
            vec![Value::from(41)],
            privsep_core::wire::empty_kwargs(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result, Value::from(42));

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn kwargs_reach_the_entrypoint_across_the_wire() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();

    let context = Arc::new(Context::new("rpc_tests::kw", vec![]));
    context
        .entrypoint("rpc_tests::kw::greet", None, |_args, kwargs| {
            let name = match &kwargs {
                Value::Map(pairs) => pairs
                    .iter()
                    .find(|(k, _)| k.as_str() == Some("name"))
                    .and_then(|(_, v)| v.as_str())
                    .unwrap_or("stranger")
                    .to_owned(),
                _ => "stranger".to_owned(),
            };
            Ok(Value::from(format!("hello, {name}")))
        })
        .unwrap();

    let server = tokio::spawn(serve(server_sock, context.clone()));
    let client = privsep_core::channel::ClientChannel::connect(
        client_sock,
        Arc::new(privsep_core::logbridge::TracingLogSink),
    )
    .await
    .unwrap();

    let kwargs = Value::Map(vec![(Value::from("name"), Value::from("ada"))]);
    let result = client
        .remote_call("rpc_tests::kw::greet", vec![], kwargs, None)
        .await
        .unwrap();
    assert_eq!(result, Value::from("hello, ada"));

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn mode_flip_dispatches_locally_without_a_channel() {
    let context = Arc::new(Context::new("rpc_tests::flip", vec![]));
    context
        .entrypoint("rpc_tests::flip::double", None, |args, _kwargs| {
            let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Value::from(n * 2))
        })
        .unwrap();

    // Still in client mode, and no channel has been started: must fail with
    // HelperUnavailable rather than hang or panic.
    let err = context
        .invoke(
            "rpc_tests::flip::double",
            vec![Value::from(5)],
            privsep_core::wire::empty_kwargs(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PrivsepError::HelperUnavailable { .. }));

    // Flipping to server mode makes the same call dispatch in-process.
    context.set_client_mode(false);
    let result = context
        .invoke(
            "rpc_tests::flip::double",
            vec![Value::from(5)],
            privsep_core::wire::empty_kwargs(),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::from(10));
}

#[tokio::test]
async fn concurrent_calls_are_independently_resolved() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();

    let context = Arc::new(Context::new("rpc_tests::conc", vec![]));
    context
        .entrypoint("rpc_tests::conc::square", None, |args, _kwargs| {
            let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Value::from(n * n))
        })
        .unwrap();

    let server = tokio::spawn(serve(server_sock, context.clone()));
    let client = Arc::new(
        privsep_core::channel::ClientChannel::connect(
            client_sock,
            Arc::new(privsep_core::logbridge::TracingLogSink),
        )
        .await
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..100i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let result = client
                .remote_call(
                    "rpc_tests::conc::square",
                    vec![Value::from(i)],
                    privsep_core::wire::empty_kwargs(),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(result, Value::from(i * i));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn slow_entrypoint_times_out_the_waiting_caller() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();

    let context = Arc::new(Context::new("rpc_tests::slow", vec![]));
    context
        .entrypoint("rpc_tests::slow::nap", None, |_args, _kwargs| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Value::Nil)
        })
        .unwrap();

    let server = tokio::spawn(serve(server_sock, context.clone()));
    let client = privsep_core::channel::ClientChannel::connect(
        client_sock,
        Arc::new(privsep_core::logbridge::TracingLogSink),
    )
    .await
    .unwrap();

    let err = client
        .remote_call(
            "rpc_tests::slow::nap",
            vec![],
            privsep_core::wire::empty_kwargs(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PrivsepError::Timeout { .. }));

    client.close().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn custom_error_renders_on_the_client_without_the_concrete_type() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    privsep_core::context::register_remote_error::<QuotaExceeded>();

    let context = Arc::new(Context::new("rpc_tests::fail", vec![]));
    context
        .entrypoint("rpc_tests::fail::overdraw", None, |_args, _kwargs| {
            Err(Box::new(QuotaExceeded {
                reason: "disk allowance used up".to_owned(),
            }) as Box<dyn privsep_core::context::AnyRemoteError>)
        })
        .unwrap();

    let server = tokio::spawn(serve(server_sock, context.clone()));
    let client = privsep_core::channel::ClientChannel::connect(
        client_sock,
        Arc::new(privsep_core::logbridge::TracingLogSink),
    )
    .await
    .unwrap();

    let err = client
        .remote_call(
            "rpc_tests::fail::overdraw",
            vec![],
            privsep_core::wire::empty_kwargs(),
            None,
        )
        .await
        .unwrap_err();
    match err {
        PrivsepError::Remote {
            type_identifier,
            display,
            ..
        } => {
            assert_eq!(type_identifier, QuotaExceeded::TYPE_IDENTIFIER);
            assert_eq!(display, "quota exceeded: disk allowance used up");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn out_of_band_log_frames_reach_the_sink() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();

    let sink = Arc::new(RecordingSink {
        records: Mutex::new(Vec::new()),
    });

    let mut server_channel = privsep_core::channel::ServerChannel::new(server_sock);
    let writer = server_channel.writer();

    // Minimal server: answers the handshake PING and then sits idle while
    // the log task pushes out-of-band frames over the shared writer.
    let handshake = tokio::spawn(async move {
        while let Ok(Some((msgid, frame))) = server_channel.recv().await {
            if matches!(frame, Frame::Ping) {
                let _ = server_channel.send(msgid, Frame::Pong).await;
            }
        }
    });

    let emitted = Arc::new(AtomicUsize::new(0));
    let emitted_clone = emitted.clone();
    let log_task = tokio::spawn(async move {
        for i in 0..3 {
            writer
                .send(
                    None,
                    Frame::Log {
                        record: LogRecord::new(
                            tracing::Level::INFO,
                            "rpc_tests",
                            format!("line {i}"),
                        ),
                    },
                )
                .await
                .unwrap();
            emitted_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    let client = privsep_core::channel::ClientChannel::connect(client_sock, sink.clone())
        .await
        .unwrap();

    log_task.await.unwrap();
    assert_eq!(emitted.load(Ordering::SeqCst), 3);
    // Give the reader task a moment to drain the forwarded frames.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].message, "line 0");
    assert_eq!(records[2].message, "line 2");
    drop(records);

    client.close().await.unwrap();
    handshake.abort();
}
