use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fhecnn::he::{SimBootstrapper, SlotSimulator};
use fhecnn::io::{load_mnist_images, load_mnist_labels, load_model};
use fhecnn::metrics::{accuracy, BatchReport};
use fhecnn::model::{CnnModel, IMAGE_LEN};
use fhecnn::params::presets::f16_inference;
use fhecnn::params::security::check_security;
use fhecnn::pipeline::{run_parallel, InferenceWorker, PipelineConfig};
use fhecnn::plain::{self, Activation};

type AppResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Classify MNIST test images under encryption.
#[derive(Parser, Debug)]
#[command(name = "mnist_infer", version)]
struct Args {
    /// Directory with t10k-images-idx3-ubyte and t10k-labels-idx1-ubyte.
    #[arg(long, default_value = "data/mnist")]
    data_dir: PathBuf,

    /// Directory with conv1.weight.txt .. fc3.bias.txt.
    #[arg(long, default_value = "data/weights")]
    weights_dir: PathBuf,

    /// Number of test images, rounded down to whole batches.
    #[arg(long, default_value_t = 40)]
    images: usize,

    /// Images packed per ciphertext.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Run batches on the rayon pool, one worker per thread.
    #[arg(long)]
    parallel: bool,

    /// Decode raw logits instead of the one-hot vector.
    #[arg(long)]
    no_one_hot: bool,

    /// Seed for the noise stream and for synthetic inputs.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// Test images and labels from disk, or deterministic noise images if they are missing.
fn load_inputs(args: &Args, rng: &mut ChaCha20Rng) -> (Vec<Vec<f64>>, Option<Vec<u8>>) {
    let images = load_mnist_images(&args.data_dir.join("t10k-images-idx3-ubyte"));
    let labels = load_mnist_labels(&args.data_dir.join("t10k-labels-idx1-ubyte"));
    match (images, labels) {
        (Ok(images), Ok(labels)) => (images, Some(labels)),
        (Ok(images), Err(e)) => {
            warn!(error = %e, "labels unavailable, accuracy will not be reported");
            (images, None)
        }
        (Err(e), _) => {
            warn!(error = %e, "mnist data unavailable, using synthetic images");
            let images = (0..args.images)
                .map(|_| (0..IMAGE_LEN).map(|_| rng.random::<f64>()).collect())
                .collect();
            (images, None)
        }
    }
}

fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let mut rng = ChaCha20Rng::seed_from_u64(args.seed);

    let params = f16_inference()?;
    info!(
        log_degree = params.log_degree,
        slots = params.num_slots(),
        max_level = params.max_level,
        log_qp = params.log2_modulus(),
        secure_128 = check_security(&params, 128),
        "parameters"
    );

    let model = match load_model(&args.weights_dir) {
        Ok(model) => model,
        Err(e) => {
            warn!(error = %e, "weights unavailable, using a random model");
            CnnModel::random(args.seed)?
        }
    };
    let config = if args.no_one_hot {
        PipelineConfig::default().logits_only()
    } else {
        PipelineConfig::default()
    };

    let (images, labels) = load_inputs(&args, &mut rng);
    let batch = args.batch.max(1);
    let count = (args.images.min(images.len()) / batch) * batch;
    if count == 0 {
        return Err(format!("need at least {} images, have {}", batch, images.len()).into());
    }
    let batches: Vec<Vec<Vec<f64>>> = images[..count].chunks(batch).map(|c| c.to_vec()).collect();
    info!(images = count, batches = batches.len(), parallel = args.parallel, "starting inference");

    let start = Instant::now();
    let mut reports = Vec::with_capacity(batches.len());
    let mut predictions = Vec::with_capacity(count);
    if args.parallel {
        let seed = args.seed;
        let results = run_parallel(&batches, &model, config, || {
            let he = SlotSimulator::new(params.clone(), seed ^ rayon::current_thread_index().unwrap_or(0) as u64);
            InferenceWorker::new(he, &model, config.one_hot, SimBootstrapper::new)
        })?;
        for (i, (preds, report)) in results.into_iter().enumerate() {
            let labels = labels.as_deref().and_then(|l| l.get(i * batch..(i + 1) * batch));
            reports.push(BatchReport::new(&preds, labels, report.bootstraps, report.elapsed));
            predictions.extend(preds);
        }
    } else {
        let he = SlotSimulator::new(params.clone(), args.seed);
        let mut worker = InferenceWorker::new(he, &model, config.one_hot, SimBootstrapper::new)?;
        for (i, images) in batches.iter().enumerate() {
            let batch_start = Instant::now();
            let bootstraps = worker.levels().bootstrap_count();
            let preds = worker.classify_batch(&model, config, images)?;
            let labels = labels.as_deref().and_then(|l| l.get(i * batch..(i + 1) * batch));
            let report = BatchReport::new(
                &preds,
                labels,
                worker.levels().bootstrap_count() - bootstraps,
                batch_start.elapsed(),
            );
            info!(batch = i + 1, classes = ?preds.iter().map(|p| p.class).collect::<Vec<_>>(), "{}", report);
            reports.push(report);
            predictions.extend(preds);
        }
    }

    // Cleartext network with the same polynomial activations.
    let activations = config.relu.map(Activation::Polynomial);
    let mut agree = 0;
    for (image, pred) in images[..count].iter().zip(&predictions) {
        if plain::argmax(&plain::forward(&model, image, activations)?) == pred.class {
            agree += 1;
        }
    }

    let total = BatchReport::merge(&reports);
    println!("{}", total);
    println!("agreement with cleartext network: {}/{}", agree, count);
    if let Some(labels) = &labels {
        let classes: Vec<usize> = predictions.iter().map(|p| p.class).collect();
        println!("accuracy: {:.2}%", 100.0 * accuracy(&classes, labels));
    }
    println!("total time: {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
