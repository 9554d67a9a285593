//! End-to-end encrypted inference.
//!
//! The stage order is fixed:
//!
//! ```text
//! conv1 → relu1 → pool1 → conv2 → relu2 → [checkpoint] → pool2 → fc1 → relu3
//!       → [checkpoint] → fc2 → relu4 → fc3 → [one-hot] → decode → argmax
//! ```
//!
//! Every level-consuming stage goes through the [`LevelManager`], which
//! refreshes the ciphertext first when the stage would not fit in the
//! remaining depth. The two checkpoints additionally refresh whenever the
//! level has dropped to the configured threshold. One [`SlotLayout`] is
//! chosen at encryption time and used by every stage.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, instrument};

use crate::error::{FheCnnError, Result};
use crate::he::{Bootstrapper, EvalKeys, HomEval, KeyGen};
use crate::level::LevelManager;
use crate::linear::{conv, fc, pool};
use crate::metrics::BatchReport;
use crate::model::{CnnModel, IMAGE_LEN, NUM_CLASSES};
use crate::nonlinear::compare::{self, ONE_HOT_FLOOR};
use crate::nonlinear::relu::{relu, ReluConfig};
use crate::packing::{decode_batch, encode_batch, SlotLayout};
use crate::plain::argmax;
use crate::session::Session;

/// Level at or below which the post-ReLU checkpoints refresh.
pub const CHECKPOINT_THRESHOLD: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Activation settings for relu1..relu4.
    pub relu: [ReluConfig; 4],
    /// Replace the logits by a soft one-hot vector before decoding.
    pub one_hot: bool,
    /// Remaining depth the tournament maximum must have before it is broadcast.
    pub one_hot_floor: u32,
    pub checkpoint_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relu: [ReluConfig::default(); 4],
            one_hot: true,
            one_hot_floor: ONE_HOT_FLOOR,
            checkpoint_threshold: CHECKPOINT_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    /// Same configuration with the one-hot stage switched off.
    pub fn logits_only(mut self) -> Self {
        self.one_hot = false;
        self
    }
}

/// Decoded result for one sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class: usize,
    /// One-hot scores or raw logits, depending on [`PipelineConfig::one_hot`].
    pub scores: Vec<f64>,
}

impl Prediction {
    fn from_scores(scores: Vec<f64>) -> Self {
        Self { class: argmax(&scores), scores }
    }
}

/// Runs the fixed network on ciphertexts under one set of evaluation keys.
pub struct CnnPipeline<'a, E: HomEval, B: Bootstrapper<E>> {
    session: Session<'a, E>,
    levels: &'a mut LevelManager<E, B>,
    model: &'a CnnModel,
    config: PipelineConfig,
}

impl<'a, E: HomEval, B: Bootstrapper<E>> CnnPipeline<'a, E, B> {
    pub fn new(
        session: Session<'a, E>,
        levels: &'a mut LevelManager<E, B>,
        model: &'a CnnModel,
        config: PipelineConfig,
    ) -> Self {
        Self { session, levels, model, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn levels(&self) -> &LevelManager<E, B> {
        self.levels
    }

    /// Layout with one block per image at the model's stride.
    pub fn batch_layout(&self, images: usize) -> Result<SlotLayout> {
        SlotLayout::batched(images, self.model.required_stride(), self.session.num_slots())
    }

    /// Run every stage on an encrypted batch laid out by `layout`.
    ///
    /// The result holds, per block, either the ten logits or their soft
    /// one-hot encoding in local slots `0..10`.
    #[instrument(skip_all, fields(batch = layout.batch(), stride = layout.stride()))]
    pub fn evaluate(&mut self, ct: E::Ciphertext, layout: SlotLayout) -> Result<E::Ciphertext> {
        layout.check_footprint(self.model.max_footprint())?;
        if !self.levels.is_warm() {
            return Err(FheCnnError::BootstrapNotReady);
        }
        let s = self.session;
        let he = s.he();
        let model = self.model;
        let cfg = self.config;
        let levels = &mut *self.levels;
        levels.begin(he, &ct)?;

        let ct = levels.stage(he, ct, "conv1", conv::DEPTH, |ct| conv::conv2d(s, ct, &model.conv1, layout))?;
        let ct = levels.stage(he, ct, "relu1", cfg.relu[0].degree.depth(), |ct| {
            relu(s, ct, model.conv1.output().len(), cfg.relu[0], layout)
        })?;
        let ct = levels.stage(he, ct, "pool1", pool::DEPTH, |ct| {
            pool::avg_pool_2x2(s, ct, model.pool1_input(), layout)
        })?;
        let ct = levels.stage(he, ct, "conv2", conv::DEPTH, |ct| conv::conv2d(s, ct, &model.conv2, layout))?;
        let ct = levels.stage(he, ct, "relu2", cfg.relu[1].degree.depth(), |ct| {
            relu(s, ct, model.conv2.output().len(), cfg.relu[1], layout)
        })?;
        let ct = levels.checkpoint(he, ct, cfg.checkpoint_threshold, "relu2_checkpoint")?;

        let ct = levels.stage(he, ct, "pool2", pool::DEPTH, |ct| {
            pool::avg_pool_2x2(s, ct, model.pool2_input(), layout)
        })?;
        let ct = levels.stage(he, ct, "fc1", fc::DEPTH, |ct| fc::fc(s, ct, &model.fc1, layout))?;
        let ct = levels.stage(he, ct, "relu3", cfg.relu[2].degree.depth(), |ct| {
            relu(s, ct, model.fc1.out_features, cfg.relu[2], layout)
        })?;
        let ct = levels.checkpoint(he, ct, cfg.checkpoint_threshold, "relu3_checkpoint")?;

        let ct = levels.stage(he, ct, "fc2", fc::DEPTH, |ct| fc::fc(s, ct, &model.fc2, layout))?;
        let ct = levels.stage(he, ct, "relu4", cfg.relu[3].degree.depth(), |ct| {
            relu(s, ct, model.fc2.out_features, cfg.relu[3], layout)
        })?;
        let ct = levels.stage(he, ct, "fc3", fc::DEPTH, |ct| fc::fc(s, ct, &model.fc3, layout))?;

        if cfg.one_hot {
            compare::one_hot(s, levels, ct, NUM_CLASSES, cfg.one_hot_floor, layout)
        } else {
            Ok(ct)
        }
    }

    /// Encrypt one normalized image, evaluate it and decode the class.
    pub fn run_inference(&mut self, sk: &E::SecretKey, image: &[f64]) -> Result<Prediction> {
        let layout = SlotLayout::single(self.session.num_slots());
        let mut out = self.run_with_layout(sk, &[image], layout)?;
        out.pop().ok_or(FheCnnError::DimensionMismatch { expected: 1, got: 0 })
    }

    /// Evaluate several images packed into one ciphertext, one block each.
    pub fn run_batch_inference<T: AsRef<[f64]>>(&mut self, sk: &E::SecretKey, images: &[T]) -> Result<Vec<Prediction>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let layout = self.batch_layout(images.len())?;
        self.run_with_layout(sk, images, layout)
    }

    fn run_with_layout<T: AsRef<[f64]>>(
        &mut self,
        sk: &E::SecretKey,
        images: &[T],
        layout: SlotLayout,
    ) -> Result<Vec<Prediction>> {
        if let Some(bad) = images.iter().map(|i| i.as_ref().len()).find(|&len| len != IMAGE_LEN) {
            return Err(FheCnnError::DimensionMismatch { expected: IMAGE_LEN, got: bad });
        }
        let he = self.session.he();
        let start = Instant::now();
        let bootstraps = self.levels.bootstrap_count();

        let ct = encode_batch(he, sk, images, layout)?;
        let out = self.evaluate(ct, layout)?;
        let scores = decode_batch(he, sk, &out, layout, NUM_CLASSES)?;
        let predictions: Vec<Prediction> = scores.into_iter().map(Prediction::from_scores).collect();

        info!(
            images = images.len(),
            bootstraps = self.levels.bootstrap_count() - bootstraps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inference done"
        );
        Ok(predictions)
    }
}

/// Everything one thread needs to classify on its own: backend, secret
/// key, evaluation keys and a warmed-up bootstrapper.
pub struct InferenceWorker<E: KeyGen, B: Bootstrapper<E>> {
    he: E,
    sk: E::SecretKey,
    keys: EvalKeys<E>,
    levels: LevelManager<E, B>,
}

impl<E: KeyGen, B: Bootstrapper<E>> InferenceWorker<E, B> {
    /// Generate keys for every rotation the model needs and warm up the bootstrapper.
    pub fn new<F>(he: E, model: &CnnModel, one_hot: bool, make_bootstrapper: F) -> Result<Self>
    where
        F: FnOnce(E::BootstrapKey) -> B,
    {
        let start = Instant::now();
        let sk = he.gen_secret_key()?;
        let keys = EvalKeys::generate(&he, &sk, model.rotation_shifts(one_hot))?;
        let mut levels = LevelManager::new(make_bootstrapper(he.gen_bootstrap_key(&sk)?));
        levels.warmup()?;
        info!(
            rotation_keys = keys.rotations.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "worker ready"
        );
        Ok(Self { he, sk, keys, levels })
    }

    pub fn he(&self) -> &E {
        &self.he
    }

    pub fn secret_key(&self) -> &E::SecretKey {
        &self.sk
    }

    pub fn keys(&self) -> &EvalKeys<E> {
        &self.keys
    }

    pub fn levels(&self) -> &LevelManager<E, B> {
        &self.levels
    }

    pub fn classify(&mut self, model: &CnnModel, config: PipelineConfig, image: &[f64]) -> Result<Prediction> {
        let InferenceWorker { he, sk, keys, levels } = self;
        CnnPipeline::new(Session::new(he, keys), levels, model, config).run_inference(sk, image)
    }

    pub fn classify_batch<T: AsRef<[f64]>>(
        &mut self,
        model: &CnnModel,
        config: PipelineConfig,
        images: &[T],
    ) -> Result<Vec<Prediction>> {
        let InferenceWorker { he, sk, keys, levels } = self;
        CnnPipeline::new(Session::new(he, keys), levels, model, config).run_batch_inference(sk, images)
    }
}

/// Classify independent batches on the rayon pool.
///
/// Batches are split into one contiguous run per pool thread, and each run
/// builds its own worker with `factory`, so keys and bootstrapper warmup
/// are paid at most once per thread. Workers share nothing but the model.
/// Results come back in batch order, each with an unlabeled [`BatchReport`].
pub fn run_parallel<E, B, F, T>(
    batches: &[Vec<T>],
    model: &CnnModel,
    config: PipelineConfig,
    factory: F,
) -> Result<Vec<(Vec<Prediction>, BatchReport)>>
where
    E: KeyGen,
    B: Bootstrapper<E>,
    F: Fn() -> Result<InferenceWorker<E, B>> + Sync,
    T: AsRef<[f64]> + Sync,
{
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let per_worker = batches.len().div_ceil(rayon::current_num_threads().max(1));
    let runs: Vec<Vec<(Vec<Prediction>, BatchReport)>> = batches
        .par_chunks(per_worker)
        .map(|run| {
            let mut worker = factory()?;
            run.iter()
                .map(|batch| {
                    let start = Instant::now();
                    let bootstraps = worker.levels().bootstrap_count();
                    let predictions = worker.classify_batch(model, config, batch)?;
                    let report = BatchReport::new(
                        &predictions,
                        None,
                        worker.levels().bootstrap_count() - bootstraps,
                        start.elapsed(),
                    );
                    Ok((predictions, report))
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<_>>()?;
    Ok(runs.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{SimBootstrapper, SlotSimulator};
    use crate::level::LevelState;
    use crate::params::presets::{compact_test, f16_inference};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_config() {
        let cfg = PipelineConfig::default();
        assert!(cfg.one_hot);
        assert_eq!(cfg.one_hot_floor, 4);
        assert_eq!(cfg.relu[0].scale, 2.0);
        assert!(!cfg.logits_only().one_hot);
    }

    #[test]
    fn test_layout_too_small_for_model() {
        let model = CnnModel::random(5).unwrap();
        let he = SlotSimulator::noiseless(compact_test().unwrap());
        let mut worker = InferenceWorker::new(he, &model, false, SimBootstrapper::new).unwrap();
        let image = vec![0.0; IMAGE_LEN];
        let res = worker.classify(&model, PipelineConfig::default().logits_only(), &image);
        assert!(matches!(res, Err(FheCnnError::CapacityExceeded { needed: 4608, available: 4096 })));
    }

    #[test]
    fn test_level_trace_is_consistent() {
        let model = CnnModel::random(6).unwrap();
        let he = SlotSimulator::new(f16_inference().unwrap(), 6);
        let mut worker = InferenceWorker::new(he, &model, true, SimBootstrapper::new).unwrap();
        let image: Vec<f64> = (0..IMAGE_LEN).map(|i| (i % 17) as f64 / 17.0).collect();
        let pred = worker.classify(&model, PipelineConfig::default(), &image).unwrap();
        assert!(pred.class < NUM_CLASSES);

        let events = worker.levels().events();
        assert_eq!(events[0].after, LevelState::Fresh(14));
        for e in events {
            match e.after {
                LevelState::Consumed(after) => {
                    assert!(e.before >= e.depth, "{} ran at level {}", e.stage, e.before);
                    assert_eq!(after, e.before - e.depth, "{}", e.stage);
                }
                LevelState::Refreshed(after) => assert!(after > e.before),
                LevelState::Fresh(_) => {}
            }
        }
        assert!(events.iter().any(|e| e.stage == "relu2_checkpoint"));
        assert!(worker.levels().bootstrap_count() >= 2);
    }

    #[test]
    fn test_parallel_builds_one_worker_per_thread() {
        let model = CnnModel::random(8).unwrap();
        let params = f16_inference().unwrap();
        let batches: Vec<Vec<Vec<f64>>> = (0..4).map(|b| vec![vec![b as f64 / 8.0; IMAGE_LEN]]).collect();
        let built = AtomicUsize::new(0);
        let factory = || {
            built.fetch_add(1, Ordering::SeqCst);
            InferenceWorker::new(SlotSimulator::noiseless(params.clone()), &model, false, SimBootstrapper::new)
        };

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let config = PipelineConfig::default().logits_only();
        let results = pool.install(|| run_parallel(&batches, &model, config, factory)).unwrap();
        assert_eq!(results.len(), 4);
        assert!(built.load(Ordering::SeqCst) <= 2);
        for (preds, report) in &results {
            assert_eq!(preds.len(), 1);
            assert_eq!(report.images, 1);
        }
        assert!(run_parallel::<SlotSimulator, SimBootstrapper, _, Vec<f64>>(&[], &model, config, factory)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_batch_rejects_too_many_images() {
        let model = CnnModel::random(7).unwrap();
        let he = SlotSimulator::noiseless(f16_inference().unwrap());
        let mut worker = InferenceWorker::new(he, &model, false, SimBootstrapper::new).unwrap();
        let images = vec![vec![0.0; IMAGE_LEN]; 5];
        let res = worker.classify_batch(&model, PipelineConfig::default(), &images);
        assert!(matches!(res, Err(FheCnnError::CapacityExceeded { needed: 40960, available: 32768 })));
    }
}
