#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tiered_link::core::codec::{FrameCodec, PacketCodec};
use tiered_link::core::packet::ProtocolPacket;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Whole-frame parsing must fail cleanly, never panic
    let _ = ProtocolPacket::from_bytes(data);
    let _ = PacketCodec::default().decode(data);

    // Stream decoding must make progress or wait for more bytes
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
