mod common;

use binder_rpc::{Client, DispatchError, Error, Server, Transaction, WorkerState};
use common::*;
use rand::Rng;
use std::{
    net::TcpListener as StdTcpListener,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

async fn echo_client(server: &Server) -> Client {
    Client::connect(&uri_of(server), 100, Arc::new(NoBinders), transport())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dial_failure_leaves_nothing_running() {
    init_logging();
    let port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = Client::connect(
        &format!("tcp://127.0.0.1:{port}"),
        100,
        Arc::new(NoBinders),
        transport(),
    )
    .await;
    assert!(matches!(result, Err(Error::Transport(_))), "{result:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejects_unsupported_endpoints() {
    init_logging();
    let connect = |uri: &'static str| Client::connect(uri, 100, Arc::new(NoBinders), transport());

    assert!(matches!(
        connect("udp://127.0.0.1:9").await,
        Err(Error::UnsupportedScheme(scheme)) if scheme == "udp"
    ));
    assert!(matches!(
        connect("127.0.0.1:9").await,
        Err(Error::InvalidUri(_))
    ));
    assert!(matches!(
        Server::bind("http://127.0.0.1:0", 1, Arc::new(NoBinders), transport()).await,
        Err(Error::UnsupportedScheme(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echoes_arg1() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let reply = client
        .transact(Transaction::new(1, ECHO_ARG1).with_args(42, 0))
        .wait()
        .await
        .unwrap();
    assert_eq!(i32::from_le_bytes(reply.try_into().unwrap()), 42);

    // the handshake carries node ids both ways
    assert_eq!(client.connection().handshake().wait().await, Ok(1));
    assert!(eventually(|| server.connections().iter().any(|c| c.peer_node() == Some(100))).await);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oneway_returns_without_a_reply() {
    let (server, mut records) = echo_server(1).await;
    let client = echo_client(&server).await;

    // the callee sleeps for a second; the caller only waits for the write
    let started = Instant::now();
    let sent = client
        .transact(Transaction::new(1, SLOW_ECHO).with_args(1000, 0).oneway())
        .wait_timeout(Duration::from_millis(500))
        .await;
    assert_eq!(sent, Ok(Vec::new()));
    assert!(started.elapsed() < Duration::from_millis(500));

    client
        .transact(Transaction::new(1, RECORD).with_payload(vec![7, 7]).oneway())
        .wait()
        .await
        .unwrap();
    let recorded = tokio::time::timeout(Duration::from_secs(5), records.recv())
        .await
        .unwrap();
    assert_eq!(recorded, Some(vec![7, 7]));
    assert_eq!(client.connection().pending_calls(), 0);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_replies() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let payload: Vec<u8> = {
                        let mut rng = rand::thread_rng();
                        let len = rng.gen_range(0..256);
                        (0..len).map(|_| rng.gen()).collect()
                    };
                    let reply = client
                        .transact(Transaction::new(1, ECHO_PAYLOAD).with_payload(payload.clone()))
                        .await
                        .unwrap();
                    assert_eq!(reply, payload);
                }
            })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap();
    }
    assert_eq!(client.connection().pending_calls(), 0);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_shutdown_rejects_calls_in_flight() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let in_flight = client.transact(Transaction::new(1, SLOW_ECHO).with_args(500, 0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.shutdown().await;
    let outcome = in_flight.wait_timeout(SHUTDOWN_TIMEOUT * 2).await;
    assert!(matches!(outcome, Err(Error::Transport(_))), "{outcome:?}");
    assert!(started.elapsed() < SHUTDOWN_TIMEOUT * 2);

    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.acceptor_state(), WorkerState::Stopped);
    assert!(eventually(|| client.is_closed()).await);
    // idempotent
    server.shutdown().await;
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_is_bounded_and_idempotent() {
    init_logging();
    // a peer that accepts and then never reads nor writes
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("tcp://{}", silent.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let client = Client::connect(&uri, 100, Arc::new(NoBinders), transport())
        .await
        .unwrap();
    let pending = client.transact(Transaction::new(1, ECHO_ARG1));

    let started = Instant::now();
    client.close().await;
    client.close().await;
    assert!(started.elapsed() < SHUTDOWN_TIMEOUT + Duration::from_secs(1));

    assert!(client.is_closed());
    assert_eq!(client.connection().reader_state(), WorkerState::Stopped);
    assert_eq!(client.connection().writer_state(), WorkerState::Stopped);
    assert!(matches!(pending.wait().await, Err(Error::Transport(_))));
    assert!(matches!(
        client.transact(Transaction::new(1, ECHO_ARG1)).wait().await,
        Err(Error::Transport(_))
    ));
    assert!(matches!(
        client.transact(Transaction::new(1, RECORD).oneway()).wait().await,
        Err(Error::Transport(_))
    ));
    peer.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_frame_drops_only_that_connection() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    // length prefix, then an enum tag no frame has
    raw.write_all(&[0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff]).await.unwrap();
    let mut received = Vec::new();
    let dropped = tokio::time::timeout(Duration::from_secs(5), raw.read_to_end(&mut received)).await;
    assert!(dropped.is_ok(), "server kept the malformed connection open");

    assert!(eventually(|| server.connection_count() == 1).await);
    let reply = client
        .transact(Transaction::new(1, ECHO_ARG1).with_args(7, 0))
        .wait()
        .await
        .unwrap();
    assert_eq!(reply, 7i32.to_le_bytes());

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_frame_drops_only_that_connection() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    // a length prefix far beyond the frame limit, then a single body byte
    raw.write_all(&[0xff, 0xff, 0xff, 0xff, 0x00]).await.unwrap();
    let mut received = Vec::new();
    let dropped = tokio::time::timeout(Duration::from_secs(3), raw.read_to_end(&mut received)).await;
    assert!(dropped.is_ok(), "server kept the oversized connection open");

    assert!(eventually(|| server.connection_count() == 1).await);
    let reply = client
        .transact(Transaction::new(1, ECHO_ARG1).with_args(8, 0))
        .wait()
        .await
        .unwrap();
    assert_eq!(reply, 8i32.to_le_bytes());

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_frames_reject_pending_calls_with_protocol_errors() {
    init_logging();
    let bad_frames: [&'static [u8]; 2] = [
        &[0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff],
        &[0xff, 0xff, 0xff, 0xff, 0x00],
    ];
    for bad_frame in bad_frames {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        let (call_sent, send_garbage) = oneshot::channel::<()>();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            send_garbage.await.unwrap();
            stream.write_all(bad_frame).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = Client::connect(&uri, 100, Arc::new(NoBinders), transport())
            .await
            .unwrap();
        let pending = client.transact(Transaction::new(1, ECHO_ARG1));
        call_sent.send(()).unwrap();

        let outcome = pending.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(outcome, Err(Error::Protocol(_))), "{outcome:?}");
        assert!(eventually(|| client.is_closed()).await);

        client.close().await;
        peer.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_get_works_from_a_plain_thread() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let caller = client.clone();
    let blocking = thread::spawn(move || {
        let echoed = caller
            .transact(Transaction::new(1, ECHO_PAYLOAD).with_payload(vec![4, 2]))
            .get();
        let arg1 = caller
            .transact(Transaction::new(1, ECHO_ARG1).with_args(11, 0))
            .get_timeout(Duration::from_secs(5));

        let slow = caller.transact(Transaction::new(1, SLOW_ECHO).with_args(300, 0));
        let early = slow.get_timeout(Duration::from_millis(20));
        let late = slow.get_timeout(Duration::MAX);
        (echoed, arg1, early, late)
    });
    let (echoed, arg1, early, late) = tokio::task::spawn_blocking(move || blocking.join().unwrap())
        .await
        .unwrap();

    assert_eq!(echoed, Ok(vec![4, 2]));
    assert_eq!(arg1, Ok(11i32.to_le_bytes().to_vec()));
    assert_eq!(early, Err(Error::Timeout(Duration::from_millis(20))));
    assert_eq!(late, Ok(Vec::new()));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reports_unknown_methods() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    assert_eq!(
        client.transact(Transaction::new(1, 99)).wait().await,
        Err(Error::Dispatch(DispatchError::NoSuchMethod {
            descriptor: "tests.Echo".into(),
            code: 99
        }))
    );

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_call_discards_late_reply() {
    let (server, _records) = echo_server(1).await;
    let client = echo_client(&server).await;

    let call = client.transact(
        Transaction::new(1, SLOW_ECHO)
            .with_args(200, 0)
            .with_payload(vec![1]),
    );
    assert!(call.cancel());
    assert_eq!(client.connection().pending_calls(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(call.is_cancelled());
    assert_eq!(call.try_get(), Some(Err(Error::Cancelled)));
    assert!(!call.fulfill(vec![2]));

    // the connection survives the late reply
    let reply = client
        .transact(Transaction::new(1, ECHO_PAYLOAD).with_payload(vec![3]))
        .wait()
        .await
        .unwrap();
    assert_eq!(reply, vec![3]);

    client.close().await;
    server.shutdown().await;
}
