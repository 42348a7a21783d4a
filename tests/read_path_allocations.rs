// The steady-state wait/read/release path must not touch the heap.
// Kept in its own test binary: dhat replaces the global allocator.
// Run with: cargo test --test read_path_allocations -- --nocapture

use shmflow::{ChannelConfig, PayloadDescriptor, Received, Registry, Sink, Source};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[test]
fn test_read_path_does_not_allocate() {
    let _profiler = dhat::Profiler::builder().testing().build();

    let reg = Registry::new(&format!("t{}-dhat", std::process::id())).unwrap();
    let desc = PayloadDescriptor::bytes(4096).unwrap();
    let mut sink = Sink::create(&reg, "raw", desc, &ChannelConfig::new()).unwrap();
    let mut source = Source::connect(&reg, "raw", &ChannelConfig::new()).unwrap();
    let payload = [0xabu8; 4096];

    let read_one = |sink: &mut Sink, source: &mut Source| -> u64 {
        sink.send(&payload).unwrap();
        let before = dhat::HeapStats::get().total_blocks;
        match source.wait().unwrap() {
            Received::Sample(sample) => {
                assert_eq!(sample.bytes()[4095], 0xab);
                sample.release();
            }
            Received::EndOfStream => panic!("unexpected end-of-stream"),
        }
        dhat::HeapStats::get().total_blocks - before
    };

    // Warm up lazily initialised thread-locals
    for _ in 0..10 {
        read_one(&mut sink, &mut source);
    }

    let allocated: u64 = (0..100).map(|_| read_one(&mut sink, &mut source)).sum();
    println!("blocks allocated on the read path: {}", allocated);
    dhat::assert_eq!(allocated, 0);
}
