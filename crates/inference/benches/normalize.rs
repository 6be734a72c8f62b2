use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use inference::labels::coco_labels;
use inference::result::{Boxes, KeypointInstance, Keypoints, RawResult};
use inference::ResultNormalizer;
use ndarray::{Array1, Array2};

fn pose_result(instances: usize) -> RawResult {
    let mut raw = RawResult::empty((480, 640));
    raw.boxes = Some(Boxes {
        xywh: Array2::from_shape_fn((instances, 4), |(i, j)| (i * 4 + j) as f32),
        cls: Array1::zeros(instances),
        conf: Array1::from_elem(instances, 0.8),
    });
    raw.keypoints = Some(Keypoints {
        instances: (0..instances)
            .map(|i| KeypointInstance {
                xy: Array2::from_elem((17, 2), i as f32),
                conf: Some(Array1::from_shape_fn(17, |k| k as f32 / 17.0)),
            })
            .collect(),
    });
    raw
}

fn bench_normalize(c: &mut Criterion) {
    let names = coco_labels();
    let normalizer = ResultNormalizer::new(0.5);
    let mut group = c.benchmark_group("normalize_pose");

    for instances in [1usize, 10, 100] {
        let raw = pose_result(instances);
        group.bench_with_input(BenchmarkId::from_parameter(instances), &raw, |b, raw| {
            b.iter(|| normalizer.normalize(black_box(raw), &names))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_normalize);
criterion_main!(benches);
