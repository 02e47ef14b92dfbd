//! Node contract scenarios
//!
//! Negotiation, buffer hand-off and backpressure as seen by a host.

use mediasync_engine::{
    AudioInfo, BufferData, BufferDescriptor, Choice, DataType, Direction, EngineError, Format,
    FormatDescriptor, FormatEnumerator, FormatProperty, IoStatus, MediaSubtype, MediaType, Node,
    PortIo, PortState, ProcessStatus, SampleFormat, SineSource, INVALID_ID,
};

fn s16(channels: u32, rate: u32) -> FormatDescriptor {
    Format::Audio(AudioInfo { format: SampleFormat::S16LE, channels, rate }).to_descriptor()
}

fn host_buffers(n: u32) -> Vec<BufferDescriptor> {
    (0..n)
        .map(|id| BufferDescriptor { id, data: BufferData::host(512), ring_meta: false })
        .collect()
}

#[test]
fn test_enumeration_is_pure_and_restartable() {
    let source = SineSource::new();
    let peer = FormatDescriptor::new(MediaType::Audio, MediaSubtype::Raw)
        .with(FormatProperty::Rate(Choice::Fixed(48000)));

    let mut formats = FormatEnumerator::new(&source, Direction::Output, 0, Some(&peer));
    let first: Vec<_> = formats.by_ref().collect::<Result<_, _>>().unwrap();
    assert_eq!(first.len(), 1);
    assert!(formats.next().is_none());

    formats.restart();
    let again: Vec<_> = formats.collect::<Result<_, _>>().unwrap();
    assert_eq!(first, again);
    assert_eq!(source.port(Direction::Output, 0).unwrap().state(), PortState::Unconfigured);

    let fixed = again[0].fixate().unwrap();
    assert_eq!(fixed.audio().unwrap().rate, 48000);
}

#[test]
fn test_unsupported_format_preserves_prior_state() {
    let mut source = SineSource::new();

    // unset stays unset
    let err = source.set_format(Direction::Output, 0, Some(&s16(2, 4000))).unwrap_err();
    assert!(matches!(err, EngineError::InvalidFormat(_)));
    assert_eq!(source.format(Direction::Output, 0).unwrap(), None);

    // a negotiated format survives a bad proposal
    source.set_format(Direction::Output, 0, Some(&s16(1, 96000))).unwrap();
    let s24 = Format::Audio(AudioInfo { format: SampleFormat::S24LE, channels: 1, rate: 96000 });
    let err = source.set_format(Direction::Output, 0, Some(&s24.to_descriptor())).unwrap_err();
    assert!(matches!(err, EngineError::InvalidFormat(_)));
    assert_eq!(
        source.format(Direction::Output, 0).unwrap(),
        Format::parse(&s16(1, 96000)).ok()
    );
}

#[test]
fn test_zero_free_buffers_is_backpressure() {
    let mut source = SineSource::new();
    source.set_format(Direction::Output, 0, Some(&s16(2, 48000))).unwrap();
    source.use_buffers(Direction::Output, 0, host_buffers(2)).unwrap();

    let mut held = Vec::new();
    for _ in 0..2 {
        assert_eq!(source.process().unwrap(), ProcessStatus::HaveOutput);
        let io = source.port_io(Direction::Output, 0).unwrap();
        held.push(io.buffer_id);
        *source.port_mut(Direction::Output, 0).unwrap().io_mut() =
            PortIo { buffer_id: INVALID_ID, status: IoStatus::NeedData };
    }
    let slot = source.port_io(Direction::Output, 0).unwrap();

    let err = source.process().unwrap_err();
    assert_eq!(err, EngineError::OutOfBuffers);
    assert!(err.is_backpressure());
    assert_eq!(source.port_io(Direction::Output, 0).unwrap(), slot);

    // the host's completion and the graph may both return the same buffer
    source.reuse_buffer(0, held[0]).unwrap();
    source.reuse_buffer(0, held[0]).unwrap();
    assert_eq!(source.port(Direction::Output, 0).unwrap().pool().free_count(), 1);
    assert_eq!(source.process().unwrap(), ProcessStatus::HaveOutput);
}

#[test]
fn test_clearing_format_invalidates_buffers() {
    let mut source = SineSource::new();
    source.set_format(Direction::Output, 0, Some(&s16(2, 48000))).unwrap();
    source.use_buffers(Direction::Output, 0, host_buffers(2)).unwrap();
    source.process().unwrap();
    assert_eq!(source.port(Direction::Output, 0).unwrap().state(), PortState::Streaming);

    source.set_format(Direction::Output, 0, None).unwrap();
    let port = source.port(Direction::Output, 0).unwrap();
    assert_eq!(port.state(), PortState::Unconfigured);
    assert!(port.pool().is_empty());
    assert_eq!(source.process(), Err(EngineError::NoFormat { port_id: 0 }));

    source.set_format(Direction::Output, 0, Some(&s16(2, 48000))).unwrap();
    assert_eq!(source.process(), Err(EngineError::NoBuffers { port_id: 0 }));
}

#[test]
fn test_unmappable_buffers_are_rejected() {
    let mut source = SineSource::new();
    source.set_format(Direction::Output, 0, Some(&s16(2, 48000))).unwrap();

    let buffers = vec![
        BufferDescriptor { id: 0, data: BufferData::host(512), ring_meta: false },
        BufferDescriptor { id: 1, data: BufferData::fd(DataType::MemFd, 3, 0, 512), ring_meta: false },
    ];
    let err = source.use_buffers(Direction::Output, 0, buffers).unwrap_err();
    assert!(matches!(err, EngineError::InvalidBuffer { buffer_id: 1, .. }));

    let port = source.port(Direction::Output, 0).unwrap();
    assert!(port.pool().is_empty());
    assert_eq!(port.state(), PortState::FormatNegotiated);
}
