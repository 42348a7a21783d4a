//! Named shared-memory channels for multi-process video and position pipelines.
//!
//! One `Sink` per channel writes each sample once into a small ring of slots;
//! any number of `Source`s, in any process on the host, read it in place.
//! Sources that fall behind skip to the freshest sample, the Sink blocks when
//! every slot is still held by a reader, and end-of-stream is a one-way latch
//! that every stage propagates downstream.

// Module naming follows project convention (Core = shared memory plumbing, Channel = Sink/Source API)
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, unlink_shared_memory, SharedMemoryBackend,
    };
    pub mod futex;
    pub mod process;
    pub mod segment;
}

#[allow(non_snake_case)]
pub mod Channel {
    mod config;
    mod registry;
    mod shutdown;
    mod sink;
    mod source;

    pub use config::{
        ChannelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READER_LIVENESS_TIMEOUT,
        DEFAULT_SLOT_COUNT,
    };
    pub use registry::{validate_name, Registry, DEFAULT_NAMESPACE, INIT_GRACE_PERIOD};
    pub use shutdown::Shutdown;
    pub use sink::{Sink, WritableSlot};
    pub use source::{ReadableSlot, Received, Source};

    pub mod Structs {
        pub mod Descriptor_Structs;
        pub mod Position_Structs;
        // re-export for stable path
        pub use Descriptor_Structs::{
            DescriptorExpectation, ElementKind, PayloadDescriptor, PixelFormat, SampleMeta, Shape,
        };
        pub use Position_Structs::{Point2D, Position2D, UnitOfLength};
    }
}

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod error;
pub mod stage;

pub use error::{Error, Result};
pub use Channel::Structs::{
    DescriptorExpectation, ElementKind, PayloadDescriptor, PixelFormat, SampleMeta, Shape,
};
pub use Channel::{ChannelConfig, ReadableSlot, Received, Registry, Shutdown, Sink, Source};
