//! Basic example of zerg_broker usage: a local thread-pool consumer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zerg_broker::{
    Broker, BrokerConfig, BrokerExecutor, Executor, ExecutorConfig, LocalConsumer, ProcessingFault,
    Processable, ReturnPolicy, WorkItem,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fibonacci {
    n: u32,
    result: u64,
}

impl Processable for Fibonacci {
    fn process(&mut self) -> Result<(), ProcessingFault> {
        if self.n > 90 {
            return Err(ProcessingFault::new(format!("fib({}) overflows u64", self.n)));
        }
        let (mut a, mut b) = (0u64, 1u64);
        for _ in 0..self.n {
            (a, b) = (b, a + b);
        }
        self.result = a;
        Ok(())
    }
}

fn main() -> zerg_broker::Result<()> {
    env_logger::init();

    let broker = Broker::init_global(BrokerConfig::default())?;
    broker.enrol(Box::new(LocalConsumer::<Fibonacci>::new(4)))?;

    let mut executor = BrokerExecutor::<Fibonacci>::with_global_broker(ExecutorConfig::default())?;
    let items = (0..20)
        .map(|i| WorkItem::new(Fibonacci { n: i * 5, result: 0 }))
        .collect();

    let report = executor.work_on(items, ReturnPolicy::ExpectFullReturn, Duration::from_secs(2))?;
    for item in &report.processed {
        println!("fib({}) = {}", item.payload().n, item.payload().result);
    }
    for item in &report.exception_caught {
        println!("fib({}) failed: {}", item.payload().n, item.error().unwrap_or("?"));
    }

    broker.shutdown();
    Broker::<Fibonacci>::teardown_global();
    Ok(())
}
