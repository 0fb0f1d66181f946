//! 网络consumer与客户端的端到端测试
//!
//! 测试场景：
//! 1. 本地与网络consumer混合时的完整返回与轮询分发
//! 2. 客户端处理失败不影响会话
//! 3. 握手序列化模式不一致
//! 4. 在途工作单元在断线后被标记并回收
//! 5. 失联会话检测
//! 6. port注销后返回的结果交还broker

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use zerg_broker::protocol::frame::{read_frame, write_frame};
use zerg_broker::protocol::{Envelope, FrameKind, Hello, DEFAULT_MAX_FRAME_LEN};
use zerg_broker::{
    BrokerExecutor, Client, CloseCode, Command, Consumer, Executor, ExecutorConfig, LocalConsumer,
    ProcessingStatus, ReturnPolicy, SerializationMode, WorkItem,
};
mod test_utils;
use test_utils::{client_config, init_logger, server_config, start_server, test_broker, Square};

/// 完成握手的原始TCP连接，用来模拟异常客户端
async fn raw_handshake(port: u16, mode: SerializationMode) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut stream, &Hello::new(mode).to_frame()).await.unwrap();
    let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
    assert_eq!(reply.kind, FrameKind::Hello);
    stream
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_mixed_consumers_full_return() {
    init_logger();
    let broker = test_broker();
    broker.enrol(Box::new(LocalConsumer::<Square>::new(1))).unwrap();
    let local_port = broker.port_ids()[0];

    let (mut server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));
    let remote_port = broker
        .port_ids()
        .into_iter()
        .find(|id| *id != local_port)
        .unwrap();

    let client = Client::<Square>::new(client_config(tcp_port, SerializationMode::Binary));
    let stop = client.stop_signal();
    let drone = thread::spawn(move || client.run_blocking().unwrap());

    let mut executor = BrokerExecutor::new(Arc::clone(&broker), ExecutorConfig::default());
    let work: Vec<_> = (0..4).map(|v| WorkItem::new(Square::slow(v, 50))).collect();
    let report = executor
        .work_on(work, ReturnPolicy::ExpectFullReturn, Duration::from_secs(1))
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.processed.len(), 4);
    assert_eq!(report.resubmissions, 0);
    for item in &report.processed {
        let v = item.position() as i64;
        assert_eq!(item.payload().value, v * v);
        let expected_port = if item.position() % 2 == 0 { local_port } else { remote_port };
        assert_eq!(item.port(), Some(expected_port), "position {}", item.position());
    }

    stop.trigger();
    let client_report = drone.join().unwrap();
    assert_eq!(client_report.processed, 2);
    assert_eq!(client_report.close_code, CloseCode::Normal);
    assert_eq!(server.stats().items_served(), 2);
    assert_eq!(server.stats().results_returned(), 2);

    server.stop().unwrap();
    broker.shutdown();
    assert_eq!(broker.port_count(), 0);
}

#[test]
fn test_client_fault_keeps_session_open() {
    init_logger();
    let broker = test_broker();
    let (server, tcp_port) = start_server(&broker, server_config(SerializationMode::Text));

    let mut config = client_config(tcp_port, SerializationMode::Text);
    config.process_max = 2;
    let client = Client::<Square>::new(config);
    let drone = thread::spawn(move || client.run_blocking().unwrap());

    broker.submit(WorkItem::new(Square::faulty(3)), Duration::from_millis(100)).unwrap();
    broker.submit(WorkItem::new(Square::new(4)), Duration::from_millis(100)).unwrap();

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let item = broker.retrieve(Duration::from_secs(5)).unwrap();
        statuses.push((item.payload().value, item.status()));
    }
    statuses.sort_by_key(|(v, _)| *v);
    assert_eq!(
        statuses,
        vec![(3, ProcessingStatus::ExceptionCaught), (16, ProcessingStatus::Processed)]
    );

    let report = drone.join().unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.exceptions, 1);
    assert_eq!(report.reconnects, 0);
    assert_eq!(report.close_code, CloseCode::Normal);
    assert_eq!(server.stats().accepted_sessions(), 1);
}

#[test]
fn test_mode_mismatch_is_rejected() {
    init_logger();
    let broker = test_broker();
    let (server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));

    let client = Client::<Square>::new(client_config(tcp_port, SerializationMode::Xml));
    let report = client.run_blocking().unwrap();
    assert_eq!(report.close_code, CloseCode::InternalError);
    assert_eq!(report.reconnects, 0);
    assert_eq!(report.processed, 0);
    assert_eq!(server.stats().items_served(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_item_is_salvaged() {
    init_logger();
    let broker = test_broker();
    let (_server, tcp_port) = start_server(&broker, server_config(SerializationMode::Text));
    broker.submit(WorkItem::new(Square::new(6)), Duration::from_millis(100)).unwrap();

    let mut stream = raw_handshake(tcp_port, SerializationMode::Text).await;
    let request = Envelope::<Square>::fetch_work().to_frame(SerializationMode::Text).unwrap();
    write_frame(&mut stream, &request).await.unwrap();
    let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
    let envelope = Envelope::<Square>::from_frame(&reply, SerializationMode::Text).unwrap();
    assert_eq!(envelope.command, Command::Compute);
    let sent = envelope.item.unwrap();

    // 拿到工作后直接断开
    drop(stream);

    let broker_for_retrieve = Arc::clone(&broker);
    let item = tokio::task::spawn_blocking(move || broker_for_retrieve.retrieve(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.id(), sent.id());
    assert_eq!(item.status(), ProcessingStatus::ErrorFlagged);
    assert_eq!(item.payload().value, 6);
    assert!(item.error().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_after_deregistration_is_handed_back() {
    init_logger();
    let broker = test_broker();
    let (_server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));
    let port = broker.port_ids()[0];
    broker.submit(WorkItem::new(Square::new(9)), Duration::from_millis(100)).unwrap();

    let mut stream = raw_handshake(tcp_port, SerializationMode::Binary).await;
    let request = Envelope::<Square>::fetch_work().to_frame(SerializationMode::Binary).unwrap();
    write_frame(&mut stream, &request).await.unwrap();
    let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
    let mut item = Envelope::<Square>::from_frame(&reply, SerializationMode::Binary)
        .unwrap()
        .item
        .unwrap();
    item.process().unwrap();

    // 客户端处理期间port被注销
    broker.deregister_port(port).unwrap();
    let result = Envelope::result(item.clone()).to_frame(SerializationMode::Binary).unwrap();
    write_frame(&mut stream, &result).await.unwrap();

    let waiter = Arc::clone(&broker);
    let returned = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(2), || waiter.orphan_count() == 1);
        waiter.retrieve(Duration::from_millis(10))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(returned.id(), item.id());
    assert_eq!(returned.status(), ProcessingStatus::Processed);
    assert_eq!(returned.payload().value, 81);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_client_is_detected_as_stale() {
    init_logger();
    let broker = test_broker();
    let mut config = server_config(SerializationMode::Binary);
    config.ping_interval_ms = 20;
    config.max_open_pings = 2;
    let (server, tcp_port) = start_server(&broker, config);

    // 握手后不再读写
    let _silent = raw_handshake(tcp_port, SerializationMode::Binary).await;
    let stats = server.stats();
    let detected = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(3), || stats.stale_sessions() == 1)
    })
    .await
    .unwrap();
    assert!(detected);
    assert!(wait_until(Duration::from_secs(1), || server.stats().active_sessions() == 0));
}

#[test]
fn test_networked_consumer_lifecycle() {
    let broker = test_broker();
    let mut server = zerg_broker::NetworkedConsumer::<Square>::new(server_config(SerializationMode::Binary));
    assert!(server.start().is_err());
    assert!(!server.capable_of_full_return());

    let id = server.register_port(&broker).unwrap();
    assert_eq!(server.register_port(&broker).unwrap(), id);
    server.start().unwrap();
    assert!(server.is_running());
    assert!(server.local_addr().is_some());

    server.stop().unwrap();
    assert!(!server.is_running());
    assert!(broker.port(id).is_none());
}
