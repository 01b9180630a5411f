#![no_main]
use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use ruda::segment::{read_conv, Segment, HEADER_LEN};

fuzz_target!(|data: &[u8]| {
    let _ = read_conv(data);

    // Decode must never panic, whatever the wire carries, and anything it
    // accepts must re-encode to a decodable segment.
    let mut buf = Bytes::copy_from_slice(data);
    while buf.len() >= HEADER_LEN {
        match Segment::decode(&mut buf, 1400) {
            Ok(seg) => {
                let mut wire = BytesMut::new();
                seg.encode(&mut wire);
                let mut wire = wire.freeze();
                let again = Segment::decode(&mut wire, 1400).unwrap();
                assert_eq!(again.sn, seg.sn);
                assert_eq!(again.data, seg.data);
            }
            Err(_) => {
                // Truncated stops the loop; anything else already consumed
                // bytes, keep scanning
                if buf.len() < HEADER_LEN {
                    break;
                }
            }
        }
    }
});
