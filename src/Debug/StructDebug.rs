use crate::Channel::{Sink, Source};
use crate::Core::segment::Segment;
use std::fmt;
use std::sync::atomic::Ordering;

/// Debug function for Segment
///
/// Shows the channel, its geometry and the live header counters without
/// exposing raw pointers into the mapping.
pub fn debug_segment(segment: &Segment, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let header = segment.header();
    f.debug_struct("Segment")
        .field("channel", &segment.channel())
        .field("object", &segment.object_name())
        .field("descriptor", &format_args!("{}", segment.descriptor()))
        .field("geometry", segment.geometry())
        .field("state", &segment.state())
        .field("sink_pid", &segment.sink_pid())
        .field("latest_seq", &header.latest_seq.load(Ordering::Relaxed))
        .field("readers", &segment.reader_count())
        .finish()
}

/// Debug function for Sink
pub fn debug_sink(sink: &Sink, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sink")
        .field("name", &sink.name())
        .field("descriptor", &format_args!("{}", sink.descriptor()))
        .field("last_sequence", &sink.last_sequence())
        .field("readers", &sink.reader_count())
        .field("closed", &sink.is_closed())
        .finish_non_exhaustive()
}

/// Debug function for Source
pub fn debug_source(source: &Source, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Source")
        .field("name", &source.name())
        .field("descriptor", &format_args!("{}", source.descriptor()))
        .field("last_read", &source.last_read())
        .finish_non_exhaustive()
}
