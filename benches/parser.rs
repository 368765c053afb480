//! Parser throughput under different chunk granularities.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use midstream::{StructuralParser, TagGrammar};

fn transcript() -> String {
    let mut text = String::new();
    for i in 0..200 {
        text.push_str("<thinking>considering the request carefully</thinking>");
        text.push_str("Here is some visible prose about the task at hand. ");
        text.push_str(&format!(
            "<function_calls><invoke name=\"tool_{i}\">\
             <parameter name=\"query\">value {i}</parameter>\
             </invoke></function_calls>"
        ));
        text.push_str("\n<function_results><result tool_use_id=\"call_1\">ok</result></function_results>");
        text.push_str("And a closing remark with an <unknown> tag.\n");
    }
    text
}

fn feed_in_chunks(text: &str, chunk_size: usize) -> usize {
    let grammar = TagGrammar::default().into_shared();
    let mut parser = StructuralParser::new(grammar);
    let mut emissions = 0;

    let chars: Vec<char> = text.chars().collect();
    for chunk in chars.chunks(chunk_size) {
        let s: String = chunk.iter().collect();
        emissions += parser.feed(&s).len();
    }
    emissions += parser.finalize().len();
    emissions
}

fn bench_parser(c: &mut Criterion) {
    let text = transcript();

    c.bench_function("parse_1_byte_chunks", |b| {
        b.iter(|| feed_in_chunks(black_box(&text), 1))
    });

    c.bench_function("parse_64_byte_chunks", |b| {
        b.iter(|| feed_in_chunks(black_box(&text), 64))
    });

    c.bench_function("parse_single_chunk", |b| {
        b.iter(|| feed_in_chunks(black_box(&text), text.len()))
    });
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
