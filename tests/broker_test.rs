//! Broker集成测试
//!
//! 包含四类测试场景：
//! 1. 轮询分发与公平性
//! 2. 注册表边界(空/满)
//! 3. 注销时的唤醒与残留回收
//! 4. consumer加入与全局实例

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zerg_broker::{
    Broker, BrokerConfig, BrokerError, Consumer, LocalConsumer, ProcessingStatus, WorkItem,
};
mod test_utils;
use test_utils::{init_logger, items, test_broker, Square};

mod routing {
    use super::*;

    #[test]
    fn test_round_robin_alternates_ports() {
        init_logger();
        let broker = test_broker();
        let a = broker.register_port().unwrap();
        let b = broker.register_port().unwrap();

        for item in items(4) {
            broker.submit(item, Duration::from_millis(100)).unwrap();
        }
        assert_eq!(a.outbound_len(), 2);
        assert_eq!(b.outbound_len(), 2);

        let first_a = a.pop_outbound(None).unwrap();
        let second_a = a.pop_outbound(None).unwrap();
        assert_eq!(first_a.payload().value, 0);
        assert_eq!(second_a.payload().value, 2);
        assert_eq!(first_a.port(), Some(a.id()));

        let first_b = b.pop_outbound(None).unwrap();
        assert_eq!(first_b.payload().value, 1);
        assert_eq!(first_b.port(), Some(b.id()));
    }

    #[test]
    fn test_submit_skips_full_port() {
        let broker = Broker::new(BrokerConfig {
            port_capacity: 1,
            poll_slice_ms: 5,
            ..BrokerConfig::default()
        });
        let a = broker.register_port().unwrap();
        let b = broker.register_port().unwrap();
        a.push_outbound(WorkItem::new(Square::new(99)), None).unwrap();

        let routed = broker.submit(WorkItem::new(Square::new(1)), Duration::from_millis(50)).unwrap();
        assert_eq!(routed, b.id());

        // 两个port都满时在截止时间后超时
        let err = broker
            .submit(WorkItem::new(Square::new(2)), Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err, BrokerError::Timeout);
    }

    #[test]
    fn test_retrieve_collects_from_all_ports() {
        let broker = test_broker();
        let a = broker.register_port().unwrap();
        let b = broker.register_port().unwrap();
        a.push_inbound(WorkItem::new(Square::new(1)), None).unwrap();
        b.push_inbound(WorkItem::new(Square::new(2)), None).unwrap();

        let mut values: Vec<_> = (0..2)
            .map(|_| broker.retrieve(Duration::from_millis(100)).unwrap().payload().value)
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(
            broker.retrieve(Duration::from_millis(20)).unwrap_err(),
            BrokerError::Timeout
        );
    }

    #[test]
    fn test_concurrent_retrieves_rotate_and_never_duplicate() {
        let broker = test_broker();
        let ports: Vec<_> = (0..3).map(|_| broker.register_port().unwrap()).collect();
        for (i, port) in ports.iter().enumerate() {
            for _ in 0..10 {
                port.push_inbound(WorkItem::new(Square::new(i as i64)), None).unwrap();
            }
        }

        // 单线程取回时依次轮到每个port
        let mut first: Vec<_> = (0..3)
            .map(|_| broker.retrieve(Duration::from_millis(10)).unwrap().payload().value)
            .collect();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 2]);

        let takers: Vec<_> = (0..4)
            .map(|_| {
                let broker = Arc::clone(&broker);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Ok(item) = broker.retrieve(Duration::from_millis(20)) {
                        ids.push(item.id());
                    }
                    ids
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for taker in takers {
            for id in taker.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 27);
    }

    #[test]
    fn test_blocked_retrieve_wakes_on_result() {
        let broker = test_broker();
        let port = broker.register_port().unwrap();
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            port.push_inbound(WorkItem::new(Square::new(4)), None).unwrap();
        });
        let item = broker.retrieve(Duration::from_secs(5)).unwrap();
        assert_eq!(item.payload().value, 4);
        pusher.join().unwrap();
    }
}

mod registry {
    use super::*;

    #[test]
    fn test_empty_registry() {
        let broker = test_broker();
        assert_eq!(
            broker.submit(WorkItem::new(Square::new(1)), Duration::from_millis(10)).unwrap_err(),
            BrokerError::NoPortsAvailable
        );
        assert_eq!(
            broker.retrieve(Duration::from_millis(10)).unwrap_err(),
            BrokerError::NoPortsAvailable
        );
    }

    #[test]
    fn test_registry_full() {
        let broker: Arc<Broker<Square>> = Broker::new(BrokerConfig {
            max_registered_ports: 2,
            ..BrokerConfig::default()
        });
        broker.register_port().unwrap();
        broker.register_port().unwrap();
        assert_eq!(
            broker.register_port().unwrap_err(),
            BrokerError::RegistryFull { max: 2 }
        );
        assert_eq!(broker.port_count(), 2);
    }

    #[test]
    fn test_unknown_port() {
        let broker = test_broker();
        assert_eq!(broker.deregister_port(42).unwrap_err(), BrokerError::UnknownPort(42));
    }
}

mod deregistration {
    use super::*;

    #[test]
    fn test_deregister_releases_blocked_retrieve() {
        init_logger();
        let broker = test_broker();
        let port = broker.register_port().unwrap();

        let waiter = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                let result = broker.retrieve(Duration::from_secs(10));
                (result, Instant::now())
            })
        };

        thread::sleep(Duration::from_millis(50));
        let closed_at = Instant::now();
        broker.deregister_port(port.id()).unwrap();

        let (result, woke_at) = waiter.join().unwrap();
        assert_eq!(result.unwrap_err(), BrokerError::PortClosed);
        assert!(woke_at.duration_since(closed_at) < Duration::from_millis(100));
    }

    #[test]
    fn test_deregister_salvages_queued_items() {
        let broker = test_broker();
        let port = broker.register_port().unwrap();

        broker.submit(WorkItem::new(Square::new(3)), Duration::from_millis(10)).unwrap();
        let mut done = WorkItem::new(Square::new(5));
        done.process().unwrap();
        port.push_inbound(done, None).unwrap();

        broker.deregister_port(port.id()).unwrap();
        assert!(port.is_closed());
        assert_eq!(broker.orphan_count(), 2);

        let mut by_status = HashMap::new();
        for _ in 0..2 {
            let item = broker.retrieve(Duration::from_millis(10)).unwrap();
            by_status.insert(item.status(), item);
        }
        assert_eq!(by_status[&ProcessingStatus::Processed].payload().value, 25);
        let flagged = &by_status[&ProcessingStatus::ErrorFlagged];
        assert_eq!(flagged.payload().value, 3);
        assert_eq!(flagged.error(), Some("port closed before processing"));
    }

    #[test]
    fn test_deregister_during_execution_hands_result_back() {
        init_logger();
        let broker = test_broker();
        let mut consumer = LocalConsumer::<Square>::new(1).with_poll_interval(Duration::from_millis(5));
        let port = consumer.register_port(&broker).unwrap();
        consumer.start().unwrap();

        broker.submit(WorkItem::new(Square::slow(7, 200)), Duration::from_millis(100)).unwrap();
        thread::sleep(Duration::from_millis(50));
        broker.deregister_port(port).unwrap();
        assert_eq!(broker.orphan_count(), 0);

        // 工作线程执行完后写回失败，结果进入孤儿队列
        let deadline = Instant::now() + Duration::from_secs(2);
        while broker.orphan_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let item = broker.retrieve(Duration::from_millis(10)).unwrap();
        assert_eq!(item.status(), ProcessingStatus::Processed);
        assert_eq!(item.payload().value, 49);
        assert_eq!(broker.orphan_count(), 0);
        consumer.stop().unwrap();
    }

    #[test]
    fn test_hand_back_flags_pending_items() {
        let broker = test_broker();
        let port = broker.register_port().unwrap();
        broker.deregister_port(port.id()).unwrap();

        let mut done = WorkItem::new(Square::new(4));
        done.process().unwrap();
        assert!(port.hand_back(done, "late"));
        assert!(port.hand_back(WorkItem::new(Square::new(5)), "late"));
        assert_eq!(broker.orphan_count(), 2);

        let first = broker.retrieve(Duration::from_millis(10)).unwrap();
        assert_eq!(first.status(), ProcessingStatus::Processed);
        assert_eq!(first.error(), None);
        let second = broker.retrieve(Duration::from_millis(10)).unwrap();
        assert_eq!(second.status(), ProcessingStatus::ErrorFlagged);
        assert_eq!(second.error(), Some("late"));

        // 不属于任何broker的port无处交还
        let detached = zerg_broker::BufferPort::<Square>::new(99, 4);
        assert!(!detached.hand_back(WorkItem::new(Square::new(1)), "late"));
    }
}

mod consumers {
    use super::*;

    #[test]
    fn test_enrolled_local_consumer_processes_items() {
        init_logger();
        let broker = test_broker();
        assert!(!broker.has_consumers());
        broker.enrol(Box::new(LocalConsumer::<Square>::new(2))).unwrap();
        assert!(broker.has_consumers());
        assert!(broker.capable_of_full_return());
        assert_eq!(broker.processing_units_estimate(), 2);

        for item in items(10) {
            broker.submit(item, Duration::from_millis(100)).unwrap();
        }
        let mut values: Vec<_> = (0..10)
            .map(|_| {
                let item = broker.retrieve(Duration::from_secs(5)).unwrap();
                assert_eq!(item.status(), ProcessingStatus::Processed);
                item.payload().value
            })
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..10).map(|v| v * v).collect::<Vec<_>>());

        broker.shutdown();
        assert!(!broker.has_consumers());
        assert_eq!(broker.port_count(), 0);
    }

    #[test]
    fn test_local_consumer_catches_faults() {
        let broker = test_broker();
        broker.enrol(Box::new(LocalConsumer::<Square>::new(1))).unwrap();
        broker.submit(WorkItem::new(Square::faulty(2)), Duration::from_millis(100)).unwrap();
        broker.submit(WorkItem::new(Square::panicking(3)), Duration::from_millis(100)).unwrap();

        for _ in 0..2 {
            let item = broker.retrieve(Duration::from_secs(5)).unwrap();
            assert_eq!(item.status(), ProcessingStatus::ExceptionCaught);
            assert!(item.error().is_some());
        }
        broker.shutdown();
    }

    #[test]
    fn test_global_broker_lifecycle() {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct Marker(u8);
        impl zerg_broker::Processable for Marker {
            fn process(&mut self) -> Result<(), zerg_broker::ProcessingFault> {
                Ok(())
            }
        }

        assert!(Broker::<Marker>::global().is_none());
        let broker = Broker::<Marker>::init_global(BrokerConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&broker, &Broker::<Marker>::global().unwrap()));
        assert_eq!(
            Broker::<Marker>::init_global(BrokerConfig::default()).err(),
            Some(BrokerError::AlreadyInitialized)
        );
        assert!(Broker::<Marker>::teardown_global());
        assert!(Broker::<Marker>::global().is_none());
        assert!(!Broker::<Marker>::teardown_global());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_round_robin_fairness(ports in 1usize..6, rounds in 1usize..8) {
        let broker = test_broker();
        let registered: Vec<_> = (0..ports).map(|_| broker.register_port().unwrap()).collect();
        for item in items(ports * rounds) {
            broker.submit(item, Duration::from_millis(50)).unwrap();
        }
        for port in &registered {
            prop_assert_eq!(port.outbound_len(), rounds);
        }
    }

    #[test]
    fn test_items_reside_in_one_queue_at_a_time(ports in 1usize..5, n in 1usize..40) {
        let broker = test_broker();
        let registered: Vec<_> = (0..ports).map(|_| broker.register_port().unwrap()).collect();
        // 所有队列中的工作单元数 + 执行中的数量
        let resident = |in_hand: usize| -> usize {
            registered
                .iter()
                .map(|p| p.outbound_len() + p.inbound_len())
                .sum::<usize>()
                + in_hand
        };

        for (i, item) in items(n).into_iter().enumerate() {
            broker.submit(item, Duration::from_millis(50)).unwrap();
            prop_assert_eq!(resident(0), i + 1);
        }

        let mut retrieved = HashSet::new();
        let mut rounds = 0;
        while retrieved.len() < n {
            rounds += 1;
            prop_assert!(rounds <= 2 * n, "items left in flight");
            for port in &registered {
                let Ok(mut item) = port.pop_outbound(Some(Duration::ZERO)) else {
                    continue;
                };
                prop_assert_eq!(resident(1) + retrieved.len(), n);
                item.process().unwrap();
                port.push_inbound(item, None).unwrap();
                prop_assert_eq!(resident(0) + retrieved.len(), n);
            }
            if let Ok(item) = broker.retrieve(Duration::ZERO) {
                prop_assert!(retrieved.insert(item.id()), "item {} returned twice", item.id());
                prop_assert_eq!(resident(0) + retrieved.len(), n);
            }
        }
        prop_assert_eq!(resident(0), 0);
    }
}
