use coda_core::frame::{encode_serial_message, encode_tcp_frame, SerialFramer, TcpFramer};
use coda_core::{CodaDevice, FrameDecoder, Framing, JsonValue, MemoryStream};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const CONTEXT_LIST: &[u8] = br#"[{"ID":"p1.t1","ParentID":"p1","OSID":"101","Name":"Main"},{"ID":"p1.t2","ParentID":"p1","OSID":"102","Name":"Worker \"io\""},{"ID":"p2","Name":"app.exe","Flags":[1,2,3.5e2,true,null]}]"#;

fn bench_value_parse(c: &mut Criterion) {
    c.bench_function("value_parse_context_list", |b| {
        b.iter(|| {
            let _ = black_box(JsonValue::parse(black_box(CONTEXT_LIST)));
        })
    });
}

fn bench_value_serialize(c: &mut Criterion) {
    let value = JsonValue::parse(CONTEXT_LIST);
    c.bench_function("value_serialize_compact", |b| {
        b.iter(|| {
            let _ = black_box(value.to_compact());
        })
    });
}

fn bench_tcp_deframing(c: &mut Criterion) {
    let mut wire = Vec::new();
    for _ in 0..64 {
        wire.extend(encode_tcp_frame(b"E\0RunControl\0contextSuspended\0\"p1.t1\"\x004096\0\"Breakpoint\"\0{}\0"));
    }
    c.bench_function("tcp_deframe_64_events", |b| {
        b.iter(|| {
            let mut framer = TcpFramer::new();
            let _ = black_box(framer.push(black_box(&wire)));
        })
    });
}

fn bench_serial_chunked_roundtrip(c: &mut Criterion) {
    let mut message = b"R\x001\0\"".to_vec();
    message.extend(std::iter::repeat(b'Q').take(16 * 1024));
    message.extend_from_slice(b"\"\0");
    let wire = encode_serial_message(&message).expect("within the serial limit");
    c.bench_function("serial_reassemble_16k", |b| {
        b.iter(|| {
            let mut framer = SerialFramer::new();
            let _ = black_box(framer.push(black_box(&wire)));
        })
    });
}

fn bench_engine_reply_dispatch(c: &mut Criterion) {
    c.bench_function("engine_command_reply_cycle", |b| {
        let (stream, handle) = MemoryStream::new();
        let mut device = CodaDevice::with_stream(Framing::Tcp, Box::new(stream));
        b.iter(|| {
            let token = device.send_locator_sync(|_, result| {
                black_box(result.is_success());
            }, 0);
            let _ = handle.take_written();
            device.process_incoming(format!("R\0{token}\0\x03\x01").as_bytes());
        })
    });
}

criterion_group!(
    benches,
    bench_value_parse,
    bench_value_serialize,
    bench_tcp_deframing,
    bench_serial_chunked_roundtrip,
    bench_engine_reply_dispatch
);
criterion_main!(benches);
