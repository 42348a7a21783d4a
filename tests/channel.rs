// Sink/Source behaviour within one process
// Run with: cargo test --test channel -- --nocapture

use serial_test::serial;
use shmflow::Core::segment::layout::MAX_READERS;
use shmflow::{
    ChannelConfig, DescriptorExpectation, ElementKind, Error, PayloadDescriptor, PixelFormat,
    Received, Registry, SampleMeta, Shutdown, Sink, Source,
};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Namespace private to one test, so parallel tests never share channels.
fn registry(tag: &str) -> Registry {
    Registry::new(&format!("t{}-{}", std::process::id(), tag)).unwrap()
}

fn quick() -> ChannelConfig {
    ChannelConfig::new().with_connect_timeout(Duration::from_secs(5))
}

fn expect_sample(source: &mut Source) -> (u64, Vec<u8>) {
    match source.wait().unwrap() {
        Received::Sample(sample) => {
            let out = (sample.sequence(), sample.bytes().to_vec());
            sample.release();
            out
        }
        Received::EndOfStream => panic!("unexpected end-of-stream"),
    }
}

#[test]
fn test_sources_see_increasing_sequences() {
    const SOURCES: usize = 3;
    const SAMPLES: u64 = 200;

    let reg = registry("order");
    let desc = PayloadDescriptor::bytes(64).unwrap();
    let mut sink = Sink::create(&reg, "raw", desc, &quick().with_expected_readers(SOURCES)).unwrap();

    let readers: Vec<_> = (0..SOURCES)
        .map(|_| {
            let reg = reg.clone();
            thread::spawn(move || {
                let mut source = Source::connect(&reg, "raw", &quick()).unwrap();
                let mut seen = Vec::new();
                loop {
                    match source.wait().unwrap() {
                        Received::Sample(sample) => {
                            // Payload carries its own sequence number
                            let mut word = [0u8; 8];
                            word.copy_from_slice(&sample.bytes()[..8]);
                            assert_eq!(u64::from_le_bytes(word), sample.sequence());
                            seen.push(sample.sequence());
                        }
                        Received::EndOfStream => break,
                    }
                }
                seen
            })
        })
        .collect();

    for seq in 1..=SAMPLES {
        let sent = sink.send(&seq.to_le_bytes()).unwrap();
        assert_eq!(sent, seq);
    }
    sink.set_end_of_stream();

    for reader in readers {
        let seen = reader.join().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "duplicates or reordering: {:?}", seen);
        assert_eq!(*seen.last().unwrap(), SAMPLES);
    }
}

#[test]
fn test_backpressure_blocks_until_release() {
    let reg = registry("bp");
    let desc = PayloadDescriptor::bytes(16).unwrap();
    let mut sink = Sink::create(&reg, "raw", desc, &quick().with_slot_count(2)).unwrap();
    let mut source = Source::connect(&reg, "raw", &quick()).unwrap();

    sink.send(b"one").unwrap();
    sink.send(b"two").unwrap();

    // Every slot now holds a sample the reader has not released
    let (tx, rx) = mpsc::channel();
    let producer = thread::spawn(move || {
        let result = sink.send(b"three");
        tx.send(result.is_ok()).unwrap();
        sink
    });
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "third publish should block"
    );

    let (seq, bytes) = expect_sample(&mut source);
    assert_eq!((seq, bytes.as_slice()), (2, &b"two"[..]));

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    let sink = producer.join().unwrap();
    assert_eq!(sink.last_sequence(), 3);
}

#[test]
fn test_source_heartbeats_at_the_sink_liveness() {
    let reg = registry("liveness");
    let desc = PayloadDescriptor::bytes(16).unwrap();
    let sink_config = quick()
        .with_slot_count(2)
        .with_reader_liveness_timeout(Duration::from_millis(200));
    let mut sink = Sink::create(&reg, "raw", desc, &sink_config).unwrap();
    // Left at the 2 s default: a heartbeat paced from this would look dead to the Sink
    let mut source = Source::connect(&reg, "raw", &quick()).unwrap();

    sink.send(&[1u8; 16]).unwrap();
    let held = match source.wait().unwrap() {
        Received::Sample(sample) => sample,
        Received::EndOfStream => panic!("unexpected end-of-stream"),
    };
    assert_eq!(held.sequence(), 1);

    // Slot of seq 1 is held and seq 2 is the latest, so seq 3 has nowhere to go
    let (tx, rx) = mpsc::channel();
    let producer = thread::spawn(move || {
        sink.send(&[2u8; 16]).unwrap();
        let result = sink.send(&[3u8; 16]);
        tx.send(result.is_ok()).unwrap();
        sink
    });
    // Three liveness periods: an evicted reader would have let the producer through
    assert!(
        rx.recv_timeout(Duration::from_millis(600)).is_err(),
        "live reader was evicted"
    );
    assert_eq!(held.bytes(), &[1u8; 16]);

    held.release();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    let sink = producer.join().unwrap();
    assert_eq!(sink.reader_count(), 1);
    assert_eq!(sink.last_sequence(), 3);
}

#[test]
fn test_reader_table_is_bounded() {
    let reg = registry("readers");
    let desc = PayloadDescriptor::bytes(8).unwrap();
    let sink = Sink::create(&reg, "raw", desc, &quick()).unwrap();

    let sources: Vec<Source> = (0..MAX_READERS)
        .map(|_| Source::connect(&reg, "raw", &quick()).unwrap())
        .collect();
    assert_eq!(sink.reader_count(), MAX_READERS);

    match Source::connect(&reg, "raw", &quick()) {
        Err(Error::TooManyReaders { name, max }) => {
            assert_eq!(name, "raw");
            assert_eq!(max, MAX_READERS);
        }
        other => panic!("expected TooManyReaders, got {:?}", other.map(|_| ())),
    }

    // Dropping one frees its entry
    drop(sources.into_iter().next());
    assert!(Source::connect(&reg, "raw", &quick()).is_ok());
}

#[test]
fn test_end_of_stream_unblocks_waiting_source() {
    let reg = registry("eos");
    let desc = PayloadDescriptor::bytes(16).unwrap();
    let sink = Sink::create(&reg, "raw", desc, &quick()).unwrap();
    let mut source = Source::connect(&reg, "raw", &quick()).unwrap();

    let waiter = thread::spawn(move || {
        let started = Instant::now();
        let first = source.wait().unwrap().is_end_of_stream();
        let waited = started.elapsed();
        let second = source.wait().unwrap().is_end_of_stream();
        let third = source.wait().unwrap().is_end_of_stream();
        (first, second, third, waited)
    });

    thread::sleep(Duration::from_millis(100));
    sink.set_end_of_stream();
    sink.set_end_of_stream();

    let (first, second, third, waited) = waiter.join().unwrap();
    assert!(first && second && third);
    assert!(waited >= Duration::from_millis(50));
    assert!(sink.is_closed());
}

#[test]
fn test_connect_before_create() {
    let reg = registry("rendezvous");
    let desc = PayloadDescriptor::frame(48, 64, PixelFormat::Gray8).unwrap();

    let pending = {
        let reg = reg.clone();
        thread::spawn(move || {
            Source::connect(&reg, "frames", &quick()).map(|s| *s.descriptor())
        })
    };

    thread::sleep(Duration::from_millis(100));
    let _sink = Sink::create(&reg, "frames", desc, &quick()).unwrap();

    assert_eq!(pending.join().unwrap().unwrap(), desc);
}

#[test]
fn test_round_trip_is_byte_identical() {
    const MAX: usize = 64 * 1024;

    let reg = registry("roundtrip");
    let desc = PayloadDescriptor::bytes(MAX as u64).unwrap();
    let mut sink = Sink::create(&reg, "raw", desc, &quick()).unwrap();
    let mut source = Source::connect(&reg, "raw", &quick()).unwrap();

    let mut rng = fastrand::Rng::with_seed(7);
    let mut sizes = vec![1, 2, 127, 128, 4096, MAX - 1, MAX];
    sizes.extend((0..25).map(|_| rng.usize(1..=MAX)));

    for len in sizes {
        let payload: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
        let seq = sink.send(&payload).unwrap();
        let (got_seq, got) = expect_sample(&mut source);
        assert_eq!(got_seq, seq);
        assert!(got == payload, "payload of {} bytes corrupted", len);
    }

    assert!(matches!(
        sink.send(&vec![0u8; MAX + 1]),
        Err(Error::InvalidDescriptor { .. })
    ));
}

#[test]
fn test_publish_without_readers_then_close() {
    let reg = registry("noreader");
    let desc = PayloadDescriptor::frame(480, 640, PixelFormat::Bgr8).unwrap();
    assert_eq!(desc.max_payload_size(), 640 * 480 * 3);
    let mut sink = Sink::create(&reg, "frames", desc, &quick().with_slot_count(2)).unwrap();

    let started = Instant::now();
    for expected in 1..=5u64 {
        let mut slot = sink.next_slot().unwrap();
        let frame = slot.as_mut_slice();
        frame.fill(expected as u8);
        let len = frame.len();
        assert_eq!(slot.publish(SampleMeta::now(len)).unwrap(), expected);
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sink.reader_count(), 0);

    sink.set_end_of_stream();
    assert!(sink.is_closed());
    assert_eq!(sink.last_sequence(), 5);
    assert!(matches!(sink.next_slot(), Err(Error::AlreadyClosed { .. })));
    sink.set_end_of_stream();
    assert!(sink.is_closed());
}

#[test]
fn test_slow_source_skips_to_latest() {
    let reg = registry("latest");
    let desc = PayloadDescriptor::bytes(8).unwrap();
    let mut sink = Sink::create(&reg, "raw", desc, &quick().with_slot_count(3)).unwrap();
    let mut source = Source::connect(&reg, "raw", &quick()).unwrap();

    sink.send(b"a").unwrap();
    sink.send(b"b").unwrap();

    let (seq, bytes) = expect_sample(&mut source);
    assert_eq!(seq, 2);
    assert_eq!(bytes, b"b");
    assert_eq!(source.last_read(), 2);
}

#[test]
fn test_handshake_errors() {
    let reg = registry("handshake");
    let frames = PayloadDescriptor::frame(4, 4, PixelFormat::Gray8).unwrap();
    let _sink = Sink::create(&reg, "frames", frames, &quick()).unwrap();

    // Same process, same registry
    let again = Sink::create(&reg, "frames", frames, &quick());
    assert!(matches!(again, Err(Error::NameInUse { .. })));

    // Another registry over the same namespace sees a live Sink
    let other = Registry::new(reg.namespace()).unwrap();
    let again = Sink::create(&other, "frames", frames, &quick());
    assert!(matches!(again, Err(ref e) if e.is_fatal()));

    let wrong = quick().with_expected(DescriptorExpectation::Kind(ElementKind::Position));
    match Source::connect(&reg, "frames", &wrong) {
        Err(Error::TypeMismatch { name, .. }) => assert_eq!(name, "frames"),
        other => panic!("expected TypeMismatch, got {:?}", other.map(|_| ())),
    }

    let exact = quick().with_expected(DescriptorExpectation::Exact(frames));
    assert!(Source::connect(&reg, "frames", &exact).is_ok());

    let started = Instant::now();
    let short = quick().with_connect_timeout(Duration::from_millis(150));
    match Source::connect(&reg, "missing", &short) {
        Err(Error::ConnectTimeout { name, .. }) => assert_eq!(name, "missing"),
        other => panic!("expected ConnectTimeout, got {:?}", other.map(|_| ())),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert!(matches!(
        Sink::create(&reg, "bad/name", frames, &quick()),
        Err(Error::InvalidName { .. })
    ));
    assert!(matches!(
        Sink::create(&reg, "slots", frames, &quick().with_slot_count(1)),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn test_shutdown_interrupts_blocking_calls() {
    let reg = registry("interrupt");
    let desc = PayloadDescriptor::bytes(8).unwrap();
    let shutdown = Shutdown::new();
    let config = quick().with_slot_count(2).with_shutdown(shutdown.clone());

    // Nothing is ever published on "idle", so its Source blocks in wait
    let idle = Sink::create(&reg, "idle", desc, &config).unwrap();
    let mut waiting = Source::connect(&reg, "idle", &config).unwrap();

    // "full" has a Source that never reads, so its Sink blocks on the third publish
    let mut full = Sink::create(&reg, "full", desc, &config).unwrap();
    let _stalled = Source::connect(&reg, "full", &config).unwrap();

    let reader = thread::spawn(move || waiting.wait().map(|r| r.is_end_of_stream()).err());
    let writer = thread::spawn(move || {
        full.send(b"1").unwrap();
        full.send(b"2").unwrap();
        full.send(b"3").err()
    });

    thread::sleep(Duration::from_millis(150));
    assert!(!reader.is_finished() && !writer.is_finished());
    shutdown.trigger();

    assert!(matches!(reader.join().unwrap(), Some(Error::Interrupted)));
    assert!(matches!(writer.join().unwrap(), Some(Error::Interrupted)));
    assert!(!idle.is_closed());
}

#[test]
fn test_dropping_sink_closes_and_unlinks() {
    let reg = registry("drop");
    let desc = PayloadDescriptor::position();
    let sink = Sink::create(&reg, "rpos", desc, &quick()).unwrap();
    let mut source = Source::connect(&reg, "rpos", &quick()).unwrap();
    assert_eq!(reg.channels(), vec!["rpos".to_string()]);

    drop(sink);
    assert!(reg.channels().is_empty());
    assert!(source.wait().unwrap().is_end_of_stream());

    // The name is free again
    let _sink = Sink::create(&reg, "rpos", desc, &quick()).unwrap();
}

#[test]
#[serial]
fn test_default_namespace() {
    let reg = Registry::default();
    let name = format!("default{}", std::process::id());
    let desc = PayloadDescriptor::bytes(8).unwrap();

    let sink = Sink::create(&reg, &name, desc, &quick()).unwrap();
    assert!(reg.channels().contains(&name));
    assert_eq!(sink.name(), name);
    drop(sink);
    assert!(!reg.channels().contains(&name));
}
