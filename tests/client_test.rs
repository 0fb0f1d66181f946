//! 客户端状态机测试: 停止信号、重连、无数据退避、处理上限

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use zerg_broker::protocol::frame::{read_frame, write_frame};
use zerg_broker::protocol::{Envelope, FrameKind, Hello, DEFAULT_MAX_FRAME_LEN};
use zerg_broker::{
    Client, CloseCode, Command, ConnectionState, Consumer, ProcessingFault, ProcessingStatus,
    Processable, SerializationMode, WorkItem,
};
mod test_utils;
use test_utils::{client_config, init_logger, server_config, start_server, test_broker, Square};

#[test]
fn test_stop_signal_closes_normally() {
    init_logger();
    let broker = test_broker();
    let (_server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));

    let client = Client::<Square>::new(client_config(tcp_port, SerializationMode::Binary));
    assert_eq!(client.state(), ConnectionState::Idle);
    let stop = client.stop_signal();
    let state = client.state_handle();
    let drone = thread::spawn(move || client.run_blocking().unwrap());

    thread::sleep(Duration::from_millis(100));
    assert!(state.get().is_connected());
    let stopped_at = Instant::now();
    stop.trigger();
    let report = drone.join().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(report.close_code, CloseCode::Normal);
    assert_eq!(report.reconnects, 0);
    assert_eq!(state.get(), ConnectionState::Closed);
}

#[test]
fn test_refused_connection_exhausts_reconnects() {
    init_logger();
    let port = portpicker::pick_unused_port().expect("no free port");
    let client = Client::<Square>::new(client_config(port, SerializationMode::Text));
    let report = client.run_blocking().unwrap();
    assert_eq!(report.close_code, CloseCode::GoingAway);
    assert_eq!(report.reconnects, 2);
    assert_eq!(report.processed, 0);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn test_server_shutdown_triggers_reconnects() {
    init_logger();
    let broker = test_broker();
    let (mut server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));

    let client = Client::<Square>::new(client_config(tcp_port, SerializationMode::Binary));
    let drone = thread::spawn(move || client.run_blocking().unwrap());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.stats().active_sessions(), 1);

    server.stop().unwrap();
    let report = drone.join().unwrap();
    assert_eq!(report.close_code, CloseCode::GoingAway);
    assert_eq!(report.reconnects, 2);
}

#[test]
fn test_nodata_backoff_within_bounds() {
    init_logger();
    let broker = test_broker();
    let (_server, tcp_port) = start_server(&broker, server_config(SerializationMode::Xml));

    let mut config = client_config(tcp_port, SerializationMode::Xml);
    config.max_duration_ms = 300;
    let client = Client::<Square>::new(config);
    let started = Instant::now();
    let report = client.run_blocking().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.close_code, CloseCode::Normal);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
    // 每轮至少包含20ms的服务端等待和5ms的退避
    assert!(report.no_data >= 2, "no_data = {}", report.no_data);
    assert!(report.no_data <= 13, "no_data = {}", report.no_data);
}

#[test]
fn test_process_max_halts_before_next_request() {
    init_logger();
    let broker = test_broker();
    let (_server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));
    let port = broker.port(broker.port_ids()[0]).unwrap();
    for v in 0..5 {
        broker.submit(WorkItem::new(Square::new(v)), Duration::from_millis(100)).unwrap();
    }

    let mut config = client_config(tcp_port, SerializationMode::Binary);
    config.process_max = 3;
    let report = Client::<Square>::new(config).run_blocking().unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.close_code, CloseCode::Normal);

    assert!(port.outbound_len() == 2);
    for _ in 0..3 {
        let item = broker.retrieve(Duration::from_secs(2)).unwrap();
        assert_eq!(item.status(), ProcessingStatus::Processed);
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = client_config(1, SerializationMode::Binary);
    config.nodata_min_ms = 100;
    config.nodata_max_ms = 10;
    assert!(Client::<Square>::new(config).run_blocking().is_err());
}

#[test]
fn test_networked_consumer_reports_sessions_as_units() {
    let broker = test_broker();
    let (server, tcp_port) = start_server(&broker, server_config(SerializationMode::Binary));
    assert_eq!(server.processing_units_estimate(), (0, false));

    let client = Client::<Square>::new(client_config(tcp_port, SerializationMode::Binary));
    let stop = client.stop_signal();
    let drone = thread::spawn(move || client.run_blocking().unwrap());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.processing_units_estimate(), (1, false));
    stop.trigger();
    drone.join().unwrap();
}

/// 处理后膨胀到`size`字节的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bloat {
    size: usize,
    data: Vec<u8>,
}

impl Processable for Bloat {
    fn process(&mut self) -> Result<(), ProcessingFault> {
        self.data = vec![7; self.size];
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_blocked_result_write() {
    init_logger();
    let mode = SerializationMode::Binary;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::<Bloat>::new(client_config(port, mode));
    let stop = client.stop_signal();
    let drone = tokio::spawn(async move { client.run().await });

    // 服务端握手并发出一个工作单元，之后不再读取
    let (mut stream, _) = listener.accept().await.unwrap();
    let hello = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
    assert_eq!(hello.kind, FrameKind::Hello);
    write_frame(&mut stream, &Hello::new(mode).to_frame()).await.unwrap();
    let request = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
    assert_eq!(request.kind, FrameKind::Command(Command::FetchWork));
    let work = Envelope::compute(WorkItem::new(Bloat { size: 32 << 20, data: Vec::new() }))
        .to_frame(mode)
        .unwrap();
    write_frame(&mut stream, &work).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!drone.is_finished());
    stop.trigger();

    let report = tokio::time::timeout(Duration::from_secs(5), drone)
        .await
        .expect("client ignored stop while writing")
        .unwrap();
    assert_eq!(report.close_code, CloseCode::Normal);
    assert_eq!(report.processed, 1);
    assert_eq!(report.reconnects, 0);
    drop(stream);
}
