use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeSet;
use std::sync::Arc;

use cascata::core::buffer::QuantizationInfo;
use cascata::parts::engine::EnginePart;
use cascata::parts::io::{InputPart, OutputPart};
use cascata::{compile, CompilationOptions, EstimationOptions, GraphOfParts, HardwareCapabilities};
use cascata::{PartInputSlot, PartOutputSlot};

fn chain(depth: u32, caps: &Arc<HardwareCapabilities>, options: &Arc<CompilationOptions>) -> GraphOfParts {
    let shape = [1, 128, 32, 16];
    let quant = QuantizationInfo::default();
    let mut g = GraphOfParts::new();
    g.add_part(Box::new(InputPart::new(0, shape, quant, 1))).unwrap();
    for i in 1..=depth {
        g.add_part(Box::new(EnginePart::identity(
            i,
            shape,
            quant,
            BTreeSet::from([i + 1]),
            caps.clone(),
            options.clone(),
        )))
        .unwrap();
        g.add_connection(PartInputSlot::new(i, 0), PartOutputSlot::new(i - 1, 0)).unwrap();
    }
    g.add_part(Box::new(OutputPart::new(depth + 1, shape, quant, depth + 2))).unwrap();
    g.add_connection(PartInputSlot::new(depth + 1, 0), PartOutputSlot::new(depth, 0)).unwrap();
    g
}

fn bench_compile_chain(c: &mut Criterion) {
    let caps = Arc::new(HardwareCapabilities::mainline());
    let options = Arc::new(CompilationOptions::default());
    let est = EstimationOptions::default();

    for depth in [4u32, 8] {
        c.bench_function(&format!("compile_chain_{depth}"), |b| {
            b.iter(|| {
                let graph = chain(depth, &caps, &options);
                compile(graph, &caps, &options, &est).unwrap()
            })
        });
    }
}

criterion_group!(benches, bench_compile_chain);
criterion_main!(benches);
