// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use rtsp_core::format::{Format, Media};
use rtsp_core::server::stream::ServerStream;

fn benchmark_write_rtp(c: &mut Criterion) {
    let packet = Bytes::from_static(&[0u8; 1200]);

    for reader_count in [1usize, 10, 100] {
        let fmt = Format::new(96, NonZeroU32::new(90_000).unwrap(), "H264", None, None).unwrap();
        let mut media = Media::new("video", "trackID=0");
        media.add_format(fmt).unwrap();
        let stream = ServerStream::new(vec![media]);
        let mut receivers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            let (id, rx) = stream.add_reader(0, 64);
            stream.mark_playing(0, id);
            receivers.push(rx);
        }

        c.bench_function(&format!("write_rtp/{reader_count}_readers"), |b| {
            b.iter(|| {
                stream.write_rtp(0, 96, 1000, packet.clone());
            })
        });

        drop(receivers);
    }
}

criterion_group!(benches, benchmark_write_rtp);
criterion_main!(benches);
