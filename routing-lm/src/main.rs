use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use routing_lm::cli::Args;
use routing_lm::config::{Config, TrainingConfig};
use routing_lm::data::{Corpus, CorpusSplit, TextSamplerDataset};
use routing_lm::distributed::DistributedConfig;
use routing_lm::engine;
use routing_lm::{AutoregressiveWrapper, RoutingTransformerLM, Trainer};

fn get_device(use_gpu: bool, ordinal: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(ordinal)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(ordinal)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            let _ = ordinal;
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features cuda or --features metal"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("routing_lm=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(
        epochs = args.epochs,
        use_ema = args.use_ema,
        "parsed arguments (epochs and use_ema are not used by the loop)"
    );

    let engine_config = args.engine.load_config()?;
    let dist = DistributedConfig::from_launcher(
        args.local_rank,
        args.engine.world_size,
        args.engine.comm_file.clone(),
    )?;
    let device = get_device(args.with_cuda, dist.rank)?;
    info!(device = ?device, rank = dist.rank, "selected device");

    let config = Config::enwik8();
    config.validate()?;
    let training = TrainingConfig::default();

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let model = AutoregressiveWrapper::new(RoutingTransformerLM::new(&config, vb)?);

    let corpus = Corpus::load(&args.data, CorpusSplit::default())?;
    info!(
        path = %args.data.display(),
        train = corpus.train().len(),
        validation = corpus.validation().len(),
        "loaded corpus"
    );
    let train_dataset = TextSamplerDataset::new(corpus.train(), training.seq_len);
    let val_dataset = TextSamplerDataset::new(corpus.validation(), training.seq_len);

    let (engine, loader) = engine::initialize(
        engine_config,
        dist,
        model,
        var_map,
        train_dataset,
        args.batch_size,
        device,
    )?;

    let mut trainer = Trainer::new(engine, val_dataset, training);
    trainer.run(loader)?;

    Ok(())
}
