use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relayhub::codec::{self, FrameCodec, Message};

fn multi_line_text(lines: usize) -> Message {
  let payload: Vec<String> = (0..lines).map(|i| format!("line {i} of the payload")).collect();
  Message::text(payload.join("\n"))
}

fn encode_messages(c: &mut Criterion) {
  let mut group = c.benchmark_group("codec_encode");

  for lines in [1, 10, 100] {
    let message = multi_line_text(lines);
    group.throughput(Throughput::Bytes(message.payload().len() as u64));
    group.bench_with_input(BenchmarkId::new("text", lines), &message, |b, message| {
      b.iter(|| codec::encode(black_box(message)));
    });
  }

  let binary = Message::binary(vec![0xABu8; 4096]);
  group.throughput(Throughput::Bytes(4096));
  group.bench_function("binary_4k", |b| b.iter(|| codec::encode(black_box(&binary))));

  group.finish();
}

fn parse_whole_buffer(c: &mut Criterion) {
  let mut group = c.benchmark_group("codec_parse");

  for count in [1, 10, 100] {
    let mut wire = BytesMut::new();
    for _ in 0..count {
      codec::encode_into(&multi_line_text(4), &mut wire);
    }
    let wire = wire.freeze();

    group.throughput(Throughput::Elements(count as u64));
    group.bench_with_input(BenchmarkId::from_parameter(count), &wire, |b, wire| {
      b.iter(|| {
        let mut parser = FrameCodec::new();
        let mut buf = BytesMut::from(&wire[..]);
        let mut parsed = 0;
        while let Some(message) = parser.parse(&mut buf).expect("parse failed") {
          black_box(message);
          parsed += 1;
        }
        assert_eq!(parsed, count);
      });
    });
  }
  group.finish();
}

fn parse_chunked(c: &mut Criterion) {
  let mut group = c.benchmark_group("codec_parse_chunked");
  let wire = codec::encode(&multi_line_text(20));

  for chunk in [1, 16, 256] {
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
      b.iter(|| {
        let mut parser = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut completed = None;
        for piece in wire.chunks(chunk) {
          buf.extend_from_slice(piece);
          if let Some(message) = parser.parse(&mut buf).expect("parse failed") {
            completed = Some(message);
          }
        }
        black_box(completed.expect("message not completed"));
      });
    });
  }
  group.finish();
}

criterion_group!(benches, encode_messages, parse_whole_buffer, parse_chunked);
criterion_main!(benches);
