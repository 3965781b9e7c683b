#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

// Parses arbitrary bytes as an RTSP message and, on success, writes the
// result back out — looking for a parse that succeeds but whose `write`
// panics or produces something `Message::parse` then rejects.
fuzz_target!(|data: &[u8]| {
    let Ok((msg, _consumed)) = rtsp_types::Message::parse(data) else {
        return;
    };
    let msg = msg.map_body(Bytes::from);
    let mut buf = Vec::new();
    if msg.write(&mut buf).is_err() {
        return;
    }
    let _ = rtsp_types::Message::parse(&buf);
});
