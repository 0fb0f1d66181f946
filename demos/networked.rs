//! Networked example: a server-side broker with a networked consumer and
//! a drone connecting to it over TCP.
//!
//! Run as `cargo run --example networked` for both sides in one process,
//! or `cargo run --example networked -- client <host> <port>` for a drone only.

use serde::{Deserialize, Serialize};
use std::env;
use std::thread;
use std::time::Duration;
use zerg_broker::{
    Broker, BrokerConfig, BrokerExecutor, Client, ClientConfig, Executor, ExecutorConfig,
    NetworkedConsumer, ProcessingFault, Processable, ReturnPolicy, ServerConfig, WorkItem,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrimeCount {
    below: u64,
    count: u64,
}

impl Processable for PrimeCount {
    fn process(&mut self) -> Result<(), ProcessingFault> {
        self.count = (2..self.below)
            .filter(|n| (2..).take_while(|d| d * d <= *n).all(|d| n % d != 0))
            .count() as u64;
        Ok(())
    }
}

fn run_client(host: &str, port: u16) -> zerg_broker::Result<()> {
    let report = Client::<PrimeCount>::new(ClientConfig::new(host, port)).run_blocking()?;
    println!("drone finished: {:?}", report);
    Ok(())
}

fn main() -> zerg_broker::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("client") {
        let host = args.get(2).map(String::as_str).unwrap_or("localhost");
        let port = args.get(3).and_then(|p| p.parse().ok()).unwrap_or(10000);
        return run_client(host, port);
    }

    let broker = Broker::new(BrokerConfig::default());
    let mut config = ServerConfig::with_tcp_addr("127.0.0.1:10000")?;
    config.ping_interval_ms = 500;
    broker.enrol(Box::new(NetworkedConsumer::<PrimeCount>::new(config)))?;

    let client = Client::<PrimeCount>::new(ClientConfig::new("127.0.0.1", 10000));
    let stop = client.stop_signal();
    let drone = thread::spawn(move || client.run_blocking());

    let mut executor = BrokerExecutor::new(broker.clone(), ExecutorConfig::default());
    let items = (1..=16)
        .map(|i| WorkItem::new(PrimeCount { below: i * 10_000, count: 0 }))
        .collect();
    let report = executor.work_on(items, ReturnPolicy::ResubmitAfterTimeout, Duration::from_secs(5))?;
    for item in &report.processed {
        println!("primes below {}: {}", item.payload().below, item.payload().count);
    }
    println!("missing: {}, resubmissions: {}", report.missing.len(), report.resubmissions);

    stop.trigger();
    match drone.join() {
        Ok(Ok(report)) => println!("drone finished: {:?}", report),
        Ok(Err(e)) => eprintln!("drone failed: {}", e),
        Err(_) => eprintln!("drone thread panicked"),
    }
    broker.shutdown();
    Ok(())
}
