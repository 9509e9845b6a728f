use anvil_bytecode::{
    BytecodeWriter, ClassFile, ClassHeader, FieldDef, MemberRef, MethodDef, Opcode, ResolveError,
    OBJECT_CLASS,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn resolver(_: &str, _: &str) -> Result<String, ResolveError> {
    Ok(OBJECT_CLASS.to_string())
}

fn build_class(methods: usize) -> ClassFile {
    let mut class = ClassFile::new("bench.Subject", Some(OBJECT_CLASS));
    let counter = class
        .constants
        .intern_member(MemberRef::new("bench.Subject", "counter", "I"));
    class.fields.push(FieldDef::new("counter", "I"));

    for i in 0..methods {
        let mut w = BytecodeWriter::new();
        w.emit_load_local(0);
        w.emit_indexed(Opcode::GetField, counter);
        let skip = w.emit_jump(Opcode::JmpIfFalse);
        w.emit_load_local(0);
        w.emit_load_local(0);
        w.emit_indexed(Opcode::GetField, counter);
        w.emit_const_i32(i as i32);
        w.emit_iadd();
        w.emit_indexed(Opcode::PutField, counter);
        let end = w.offset();
        w.emit_return_void();
        w.patch_jump(skip, end);
        class
            .methods
            .push(MethodDef::new(format!("step{}", i), "()V", w.into_bytes()));
    }

    class
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [1usize, 16, 128] {
        let class = build_class(size);
        group.bench_with_input(BenchmarkId::new("methods", size), &class, |b, class| {
            b.iter(|| black_box(class).encode());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [1usize, 16, 128] {
        let bytes = build_class(size).encode();
        group.bench_with_input(BenchmarkId::new("full", size), &bytes, |b, bytes| {
            b.iter(|| ClassFile::decode(black_box(bytes)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("header_only", size), &bytes, |b, bytes| {
            b.iter(|| ClassHeader::read(black_box(bytes)).unwrap());
        });
    }
    group.finish();
}

fn bench_compute_frames(c: &mut Criterion) {
    let class = build_class(64);
    c.bench_function("compute_frames_64", |b| {
        b.iter(|| {
            let mut class = class.clone();
            class.compute_frames(&resolver).unwrap();
            class
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_compute_frames);
criterion_main!(benches);
