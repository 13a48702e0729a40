use std::fs;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dirpack_archive::{ArchiveBuilder, BuildRequest, CancelFlag, CompressionLevel, measure_folder};

/// A small "album": a handful of incompressible-ish tracks plus some text.
fn album_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut seed: u32 = 0x1234_5678;
    for track in 0..8 {
        let body: Vec<u8> = (0..256 * 1024)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                (seed & 0xff) as u8
            })
            .collect();
        fs::write(dir.path().join(format!("{track:02}.flac")), body).expect("write track");
    }
    fs::write(dir.path().join("notes.txt"), "liner notes\n".repeat(4096)).expect("write notes");
    dir
}

fn bench_compression_levels(c: &mut Criterion) {
    let source = album_fixture();
    let stats = measure_folder(source.path()).expect("measure");
    let out = tempfile::tempdir().expect("tempdir");

    let mut group = c.benchmark_group("archive_build");
    group.throughput(Throughput::Bytes(stats.total_bytes));
    group.sample_size(10);

    for level in [0u32, 1, 6, 9] {
        let builder = ArchiveBuilder::new(CompressionLevel::new(level).expect("level"));
        let dest = out.path().join(format!("level-{level}.tar.gz"));
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, _| {
            b.iter(|| {
                builder
                    .build(
                        &BuildRequest {
                            source: source.path(),
                            destination: &dest,
                            total_bytes: stats.total_bytes,
                        },
                        &CancelFlag::new(),
                        |_| {},
                    )
                    .expect("build")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compression_levels);
criterion_main!(benches);
