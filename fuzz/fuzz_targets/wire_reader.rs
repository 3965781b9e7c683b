#![no_main]

use std::io::Cursor;
use std::time::SystemTime;

use libfuzzer_sys::fuzz_target;
use rtsp_core::wire::WireReader;
use rtsp_core::ConnectionContext;

fn conn_ctx() -> ConnectionContext {
    ConnectionContext {
        local_addr: "127.0.0.1:554".parse().unwrap(),
        peer_addr: "127.0.0.1:1".parse().unwrap(),
        established: SystemTime::UNIX_EPOCH,
    }
}

// Drives `WireReader::read_item` over arbitrary bytes, looking for panics in
// the `$`-frame demuxer or in `rtsp_types::Message::parse`'s error path.
fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        let mut reader = WireReader::new(Cursor::new(data), conn_ctx());
        loop {
            match reader.read_item().await {
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
});
