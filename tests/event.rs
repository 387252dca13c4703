use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opstream::{DeviceEvent, DeviceSynchronizer, Error, HostEvent, HostStream, HostSynchronizer};

#[test]
fn record_then_wait_orders_two_streams() {
    let producer = HostStream::new(0).unwrap();
    let consumer = HostStream::new(1).unwrap();

    let produced = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));

    let flag = produced.clone();
    producer
        .submit(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    let mut event = HostEvent::new();
    event.record(&producer).unwrap();
    assert!(event.needs_wait());
    event.wait(&consumer).unwrap();
    assert!(!event.needs_wait());

    let produced2 = produced.clone();
    let observed2 = observed.clone();
    consumer
        .submit(move || {
            // Runs only after the consumer stream passed the event.
            observed2.store(produced2.load(Ordering::SeqCst), Ordering::SeqCst);
        })
        .unwrap();
    consumer.synchronize().unwrap();
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn wait_without_record_is_rejected() {
    let stream = HostStream::new(0).unwrap();
    let mut event = HostEvent::new();
    assert!(matches!(event.wait(&stream), Err(Error::Device(_))));
    assert!(matches!(event.sync(), Err(Error::Device(_))));
}

#[test]
fn query_flips_once_the_stream_reaches_the_event() {
    let stream = HostStream::new(0).unwrap();
    stream
        .submit(|| std::thread::sleep(Duration::from_millis(30)))
        .unwrap();
    let mut event = HostEvent::new();
    event.record(&stream).unwrap();
    assert!(!event.query().unwrap());
    event.sync().unwrap();
    assert!(event.query().unwrap());
}

#[test]
fn elapsed_time_between_two_fired_events() {
    let stream = HostStream::new(0).unwrap();
    let mut first = HostEvent::new();
    first.record(&stream).unwrap();
    stream
        .submit(|| std::thread::sleep(Duration::from_millis(20)))
        .unwrap();
    let mut second = HostEvent::new();
    second.record(&stream).unwrap();
    first.sync().unwrap();
    second.sync().unwrap();
    let ms = first.elapsed_time(&second).unwrap();
    assert!(ms >= 15.0, "expected at least the sleep duration, got {ms}ms");
}

#[test]
fn elapsed_time_requires_both_events_fired() {
    let stream = HostStream::new(0).unwrap();
    let mut fired = HostEvent::new();
    fired.record(&stream).unwrap();
    fired.sync().unwrap();
    let unfired = HostEvent::new();
    assert!(fired.elapsed_time(&unfired).is_err());
}

#[test]
fn event_ordered_transfer_sees_the_produced_bytes() {
    let producer = HostStream::new(0).unwrap();
    let consumer = HostStream::new(1).unwrap();
    let sync = Arc::new(HostSynchronizer::new());
    let address = sync.alloc(4);

    let sync2 = sync.clone();
    let address2 = address.clone();
    producer
        .submit(move || {
            std::thread::sleep(Duration::from_millis(20));
            sync2
                .sync_host_to_device(&address2, &[9, 9, 9, 9], 0)
                .unwrap();
        })
        .unwrap();

    let mut event = HostEvent::new();
    event.record(&producer).unwrap();
    event.wait(&consumer).unwrap();

    let out = Arc::new(Mutex::new([0u8; 4]));
    let out2 = out.clone();
    consumer
        .submit(move || {
            let mut buf = out2.lock().unwrap();
            sync.sync_device_to_host(&mut *buf, &address, 1).unwrap();
        })
        .unwrap();
    consumer.synchronize().unwrap();
    assert_eq!(*out.lock().unwrap(), [9, 9, 9, 9]);
}
