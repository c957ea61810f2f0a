use criterion::{black_box, criterion_group, criterion_main, Criterion};

use streamchat::protocol::CompletionChunk;
use streamchat::stream::{decode_line, DecodedLine, DeltaAggregator, LineFramer, SemanticEvent};

const READ_SIZE: usize = 1024;

fn content_body(deltas: usize) -> Vec<u8> {
    let mut body = String::new();
    for i in 0..deltas {
        body.push_str(&format!(
            "data: {{\"id\":\"chatcmpl_bench\",\"object\":\"chat.completion.chunk\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"token {i} caf\u{e9} \"}}}}]}}\n\n"
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

fn tool_call_lines(fragments: usize) -> Vec<String> {
    let mut lines = vec![
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"search\",\"arguments\":\"\"}}]}}]}".to_string(),
    ];
    for i in 0..fragments {
        lines.push(format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"tool_calls\":[{{\"index\":0,\"function\":{{\"arguments\":\"{i},\"}}}}]}}}}]}}"
        ));
    }
    lines.push(
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}"
            .to_string(),
    );
    lines
}

fn decode_all(lines: &[String]) -> Vec<CompletionChunk> {
    lines
        .iter()
        .filter_map(|line| match decode_line(line) {
            DecodedLine::Chunk(chunk) => Some(chunk),
            DecodedLine::Done | DecodedLine::Skipped => None,
        })
        .collect()
}

fn bench_line_framer(c: &mut Criterion) {
    let body = content_body(512);
    c.bench_function("line_framer_512_deltas_1k_reads", |b| {
        let mut lines = Vec::with_capacity(1024);
        b.iter(|| {
            lines.clear();
            let mut framer = LineFramer::new();
            for read in body.chunks(READ_SIZE) {
                framer.feed_bytes(black_box(read), &mut lines);
            }
            framer.finish(&mut lines);
            black_box(lines.len());
        });
    });
}

fn bench_decode_line(c: &mut Criterion) {
    let line = "data: {\"id\":\"chatcmpl_bench\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello there\"},\"finish_reason\":null}]}";
    c.bench_function("decode_line_content_delta", |b| {
        b.iter(|| black_box(decode_line(black_box(line))));
    });
}

fn bench_aggregate_content(c: &mut Criterion) {
    let mut lines = Vec::new();
    let mut framer = LineFramer::new();
    framer.feed_bytes(&content_body(512), &mut lines);
    let chunks = decode_all(&lines);
    c.bench_function("aggregate_512_content_deltas", |b| {
        let mut out: Vec<SemanticEvent> = Vec::with_capacity(512);
        b.iter(|| {
            out.clear();
            let mut aggregator = DeltaAggregator::new();
            for chunk in chunks.iter().cloned() {
                aggregator.push_chunk(chunk, &mut out);
            }
            black_box(out.len());
        });
    });
}

fn bench_aggregate_tool_call(c: &mut Criterion) {
    let chunks = decode_all(&tool_call_lines(256));
    c.bench_function("aggregate_tool_call_256_fragments", |b| {
        let mut out: Vec<SemanticEvent> = Vec::with_capacity(1);
        b.iter(|| {
            out.clear();
            let mut aggregator = DeltaAggregator::new();
            for chunk in chunks.iter().cloned() {
                aggregator.push_chunk(chunk, &mut out);
            }
            black_box(out.len());
        });
    });
}

criterion_group!(
    benches,
    bench_line_framer,
    bench_decode_line,
    bench_aggregate_content,
    bench_aggregate_tool_call
);
criterion_main!(benches);
