use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use fhecnn::error::FheCnnError;
use fhecnn::he::{EvalKeys, HomEval, KeyGen, SimBootstrapper, SlotSimulator};
use fhecnn::level::{LevelManager, LevelState};
use fhecnn::linear::{avg_pool_2x2, conv, conv2d, fc, pool};
use fhecnn::model::{CnnModel, ConvLayer, DenseLayer, TensorShape, IMAGE_LEN, NUM_CLASSES};
use fhecnn::nonlinear::compare::{one_hot_rotations, tournament_max, ONE_HOT_FLOOR};
use fhecnn::nonlinear::one_hot;
use fhecnn::packing::{decode_batch, decode_single, encode_batch, encode_single, SlotLayout};
use fhecnn::params::presets::{compact_test, f16_inference};
use fhecnn::pipeline::{run_parallel, InferenceWorker, PipelineConfig};
use fhecnn::plain::{self, Activation};
use fhecnn::session::Session;

fn uniform(rng: &mut ChaCha20Rng, n: usize, bound: f64) -> Vec<f64> {
    (0..n).map(|_| (rng.random::<f64>() * 2.0 - 1.0) * bound).collect()
}

fn image(seed: u64) -> Vec<f64> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    (0..IMAGE_LEN).map(|_| rng.random::<f64>()).collect()
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).fold(0.0f64, |m, (x, y)| m.max((x - y).abs()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_conv_matches_plain(
        channels in 1usize..3,
        side in 5usize..9,
        kernel in 2usize..4,
        out_channels in 1usize..3,
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let shape = TensorShape::new(channels, side, side);
        let input = uniform(&mut rng, shape.len(), 1.0);
        let weight = uniform(&mut rng, out_channels * channels * kernel * kernel, 0.5);
        let bias = uniform(&mut rng, out_channels, 0.5);
        let layer = ConvLayer::new(shape, out_channels, kernel, weight, bias).unwrap();

        let he = SlotSimulator::new(compact_test().unwrap(), seed);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, conv::rotations(&layer)).unwrap();
        let s = Session::new(&he, &keys);
        let ct = encode_single(&he, &sk, &input).unwrap();
        let out = conv2d(s, ct, &layer, SlotLayout::single(he.num_slots())).unwrap();
        prop_assert_eq!(he.level(&out).unwrap(), he.max_level() - conv::DEPTH);

        let expected = plain::conv2d(&input, &layer);
        let got = decode_single(&he, &sk, &out, expected.len() + 8).unwrap();
        prop_assert!(max_abs_diff(&got, &expected) < 1e-5);
        prop_assert!(got[expected.len()..].iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn prop_fc_matches_plain(
        in_features in 1usize..40,
        out_features in 1usize..40,
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let x = uniform(&mut rng, in_features, 1.0);
        let layer = DenseLayer::new(
            in_features,
            out_features,
            uniform(&mut rng, in_features * out_features, 0.5),
            uniform(&mut rng, out_features, 0.5),
        ).unwrap();

        let he = SlotSimulator::new(compact_test().unwrap(), seed);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, fc::rotations(&layer)).unwrap();
        let s = Session::new(&he, &keys);
        let ct = encode_single(&he, &sk, &x).unwrap();
        let out = fc(s, ct, &layer, SlotLayout::single(he.num_slots())).unwrap();

        let expected = plain::dense(&x, &layer);
        let got = decode_single(&he, &sk, &out, out_features + in_features).unwrap();
        prop_assert!(max_abs_diff(&got, &expected) < 1e-6);
        prop_assert!(got[out_features..].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn prop_pool_matches_plain(
        channels in 1usize..4,
        half_h in 1usize..5,
        half_w in 1usize..5,
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let shape = TensorShape::new(channels, 2 * half_h, 2 * half_w);
        let input = uniform(&mut rng, shape.len(), 2.0);

        let he = SlotSimulator::new(compact_test().unwrap(), seed);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, pool::rotations(shape)).unwrap();
        let s = Session::new(&he, &keys);
        let layout = SlotLayout::batched(2, 256, he.num_slots()).unwrap();
        let ct = encode_batch(&he, &sk, &[&input, &input], layout).unwrap();
        let out = avg_pool_2x2(s, ct, shape, layout).unwrap();

        let expected = plain::avg_pool_2x2(&input, shape);
        for got in decode_batch(&he, &sk, &out, layout, expected.len()).unwrap() {
            prop_assert!(max_abs_diff(&got, &expected) < 1e-5);
        }
    }

    #[test]
    fn prop_tournament_max_within_range(
        logits in prop::collection::vec(-0.9f64..0.9, 10),
        seed in any::<u64>(),
    ) {
        let he = SlotSimulator::new(compact_test().unwrap(), seed);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, one_hot_rotations(NUM_CLASSES)).unwrap();
        let mut levels = LevelManager::new(SimBootstrapper::new(he.gen_bootstrap_key(&sk).unwrap()));
        levels.warmup().unwrap();
        let s = Session::new(&he, &keys);

        let ct = encode_single(&he, &sk, &logits).unwrap();
        let max = tournament_max(s, &mut levels, ct, NUM_CLASSES, SlotLayout::single(he.num_slots())).unwrap();
        let m = decode_single(&he, &sk, &max, 1).unwrap()[0];
        let lo = logits.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(m >= lo - 1e-4 && m <= hi + 1e-4, "{} outside [{}, {}]", m, lo, hi);
    }

    #[test]
    fn prop_one_hot_argmax(
        base in prop::collection::vec(-0.6f64..0.4, 10),
        winner in 0usize..10,
        seed in any::<u64>(),
    ) {
        let mut logits = base;
        let runner_up = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        logits[winner] = runner_up + 0.3;

        let he = SlotSimulator::new(compact_test().unwrap(), seed);
        let sk = he.gen_secret_key().unwrap();
        let keys = EvalKeys::generate(&he, &sk, one_hot_rotations(NUM_CLASSES)).unwrap();
        let mut levels = LevelManager::new(SimBootstrapper::new(he.gen_bootstrap_key(&sk).unwrap()));
        levels.warmup().unwrap();
        let s = Session::new(&he, &keys);

        let ct = encode_single(&he, &sk, &logits).unwrap();
        let layout = SlotLayout::single(he.num_slots());
        let out = one_hot(s, &mut levels, ct, NUM_CLASSES, ONE_HOT_FLOOR, layout).unwrap();
        let scores = decode_single(&he, &sk, &out, NUM_CLASSES).unwrap();
        prop_assert_eq!(plain::argmax(&scores), plain::argmax(&logits));
    }
}

#[test]
fn test_missing_rotation_key_is_an_error() {
    let layer = DenseLayer::new(8, 4, vec![0.25; 32], vec![0.0; 4]).unwrap();
    let he = SlotSimulator::new(compact_test().unwrap(), 3);
    let sk = he.gen_secret_key().unwrap();
    let mut keys = EvalKeys::generate(&he, &sk, fc::rotations(&layer)).unwrap();
    keys.rotations.remove(1);
    let s = Session::new(&he, &keys);
    let ct = encode_single(&he, &sk, &[1.0; 8]).unwrap();
    let res = fc(s, ct, &layer, SlotLayout::single(he.num_slots()));
    assert!(matches!(res, Err(FheCnnError::MissingRotationKey(1))));
}

#[test]
fn test_end_to_end_matches_cleartext_network() {
    let model = CnnModel::random(11).unwrap();
    let config = PipelineConfig::default().logits_only();
    let he = SlotSimulator::new(f16_inference().unwrap(), 11);
    let mut worker = InferenceWorker::new(he, &model, false, SimBootstrapper::new).unwrap();

    let input = image(5);
    let pred = worker.classify(&model, config, &input).unwrap();
    let expected = plain::forward(&model, &input, config.relu.map(Activation::Polynomial)).unwrap();
    assert!(max_abs_diff(&pred.scores, &expected) < 1e-3, "{:?} vs {:?}", pred.scores, expected);

    let mut sorted = expected.clone();
    sorted.sort_by(|a, b| b.total_cmp(a));
    if sorted[0] - sorted[1] > 1e-2 {
        assert_eq!(pred.class, plain::argmax(&expected));
    }

    // The level never reached zero before a multiply and every refresh raised it.
    for e in worker.levels().events() {
        match e.after {
            LevelState::Consumed(_) => assert!(e.before >= e.depth && e.before > 0),
            LevelState::Refreshed(after) => assert!(after > e.before),
            LevelState::Fresh(level) => assert_eq!(level, worker.he().max_level()),
        }
    }
}

#[test]
fn test_batch_equals_single_runs() {
    let model = CnnModel::random(12).unwrap();
    let config = PipelineConfig::default();
    let he = SlotSimulator::noiseless(f16_inference().unwrap());
    let mut worker = InferenceWorker::new(he, &model, true, SimBootstrapper::new).unwrap();

    let images: Vec<Vec<f64>> = (0..4).map(|i| image(100 + i)).collect();
    let batched = worker.classify_batch(&model, config, &images).unwrap();
    assert_eq!(batched.len(), 4);
    for (img, b) in images.iter().zip(&batched) {
        let single = worker.classify(&model, config, img).unwrap();
        assert_eq!(single.class, b.class);
        assert!(max_abs_diff(&single.scores, &b.scores) < 1e-6);
    }
}

#[test]
fn test_parallel_equals_sequential() {
    let model = CnnModel::random(13).unwrap();
    let config = PipelineConfig::default().logits_only();
    let params = f16_inference().unwrap();
    let batches: Vec<Vec<Vec<f64>>> = (0..3).map(|b| (0..2).map(|i| image(200 + 2 * b + i)).collect()).collect();

    let factory = || InferenceWorker::new(SlotSimulator::noiseless(params.clone()), &model, false, SimBootstrapper::new);
    let parallel = run_parallel(&batches, &model, config, factory).unwrap();

    let mut worker = factory().unwrap();
    for (batch, (preds, report)) in batches.iter().zip(&parallel) {
        assert_eq!(report.images, batch.len());
        let sequential = worker.classify_batch(&model, config, batch).unwrap();
        for (p, s) in preds.iter().zip(&sequential) {
            assert_eq!(p.class, s.class);
            assert!(max_abs_diff(&p.scores, &s.scores) < 1e-9);
        }
    }
}
