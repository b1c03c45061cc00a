//! Training engine: owns the model, its parameters, the optimizer and the
//! data iterator for the lifetime of a run.
//!
//! [`initialize`] mirrors a distributed-engine entry point: hand it the
//! model, its parameters and the training dataset, get back an [`Engine`]
//! that knows how to run backward and optimizer steps across ranks, plus a
//! [`TrainLoader`] yielding this rank's batches.

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::autoregressive::AutoregressiveWrapper;
use crate::config::EngineConfig;
use crate::data::{Batch, TextSamplerDataset};
use crate::distributed::{self, DistributedConfig, NcclCommunicator};
use crate::error::{Error, Result};

/// Flags the engine adds to the command line.
#[derive(Debug, Clone, clap::Args)]
pub struct EngineArgs {
    /// Engine JSON config (optimizer, accumulation, clipping, checkpoints)
    #[arg(long = "engine_config")]
    pub engine_config: Option<PathBuf>,

    /// Number of processes in the training group
    #[arg(long = "world_size", env = "WORLD_SIZE", default_value_t = 1)]
    pub world_size: usize,

    /// Communication file for NCCL ID exchange
    #[arg(long = "comm_file", default_value = "nccl_id.txt")]
    pub comm_file: String,
}

impl EngineArgs {
    pub fn load_config(&self) -> Result<EngineConfig> {
        match &self.engine_config {
            Some(path) => EngineConfig::from_json(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

pub struct Engine {
    model: AutoregressiveWrapper,
    var_map: VarMap,
    optimizer: AdamW,
    config: EngineConfig,
    dist: DistributedConfig,
    comm: Option<NcclCommunicator>,
    device: Device,
    mode: Mode,
    pending: Option<GradStore>,
    micro_steps: usize,
    global_step: usize,
}

/// Wire the model, its parameters and the training data into an engine.
pub fn initialize(
    config: EngineConfig,
    dist: DistributedConfig,
    model: AutoregressiveWrapper,
    mut var_map: VarMap,
    training_data: TextSamplerDataset,
    batch_size: usize,
    device: Device,
) -> Result<(Engine, TrainLoader)> {
    if config.gradient_accumulation_steps == 0 {
        return Err(Error::Config(
            "gradient_accumulation_steps must be at least 1".into(),
        ));
    }
    let batch_size = config.train_micro_batch_size_per_gpu.unwrap_or(batch_size);
    if batch_size == 0 {
        return Err(Error::Config("batch size must be at least 1".into()));
    }

    if let Some(path) = &config.load_checkpoint {
        var_map.load(path)?;
        info!(path = %path.display(), "restored parameters");
    }

    let comm = if dist.is_distributed() {
        let comm = NcclCommunicator::new(&dist)?;
        distributed::broadcast_parameters(&var_map.all_vars(), &comm)?;
        Some(comm)
    } else {
        None
    };

    let params = ParamsAdamW {
        lr: config.optimizer.lr,
        beta1: config.optimizer.betas[0],
        beta2: config.optimizer.betas[1],
        eps: config.optimizer.eps,
        weight_decay: config.optimizer.weight_decay,
    };
    let optimizer = AdamW::new(var_map.all_vars(), params)?;

    let loader = TrainLoader::new(training_data, batch_size, dist.world_size, device.clone());

    info!(
        parameters = num_parameters(&var_map),
        batch_size,
        world_size = dist.world_size,
        rank = dist.rank,
        batches = loader.num_batches(),
        "engine initialized"
    );

    let engine = Engine {
        model,
        var_map,
        optimizer,
        config,
        dist,
        comm,
        device,
        mode: Mode::Train,
        pending: None,
        micro_steps: 0,
        global_step: 0,
    };
    Ok((engine, loader))
}

pub fn num_parameters(var_map: &VarMap) -> usize {
    var_map.all_vars().iter().map(|v| v.elem_count()).sum()
}

impl Engine {
    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Loss on a batch. In eval mode the result is detached from the graph.
    pub fn forward_loss<R: Rng + ?Sized>(
        &self,
        batch: &Batch,
        randomly_truncate: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let train = self.mode == Mode::Train;
        let loss = self.model.loss(
            &batch.tokens,
            Some(&batch.mask),
            randomly_truncate,
            train,
            rng,
        )?;
        Ok(if train { loss } else { loss.detach() })
    }

    /// Compute gradients of `loss` and add them to the pending accumulation.
    pub fn backward(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.pending = Some(match self.pending.take() {
            None => grads,
            Some(mut acc) => {
                for var in self.var_map.all_vars() {
                    let t = var.as_tensor();
                    let Some(grad) = grads.get(t) else {
                        continue;
                    };
                    let sum = match acc.get(t) {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    };
                    acc.insert(t, sum);
                }
                acc
            }
        });
        self.micro_steps += 1;
        Ok(())
    }

    pub fn is_accumulation_boundary(&self) -> bool {
        self.micro_steps % self.config.gradient_accumulation_steps == 0
    }

    /// Apply the optimizer once enough micro batches have been accumulated.
    pub fn step(&mut self) -> Result<()> {
        if !self.is_accumulation_boundary() {
            return Ok(());
        }
        let Some(mut grads) = self.pending.take() else {
            return Ok(());
        };
        let vars = self.var_map.all_vars();

        let accumulation = self.config.gradient_accumulation_steps;
        if accumulation > 1 {
            scale_gradients(&mut grads, &vars, 1.0 / accumulation as f64)?;
        }

        if let Some(comm) = &self.comm {
            distributed::all_reduce_gradients(&mut grads, &vars, comm)?;
        }

        let max_norm = self.config.gradient_clipping;
        if max_norm > 0.0 {
            let norm = global_norm(&grads, &vars)?;
            if norm > max_norm {
                debug!(norm, max_norm, "clipping gradients");
                scale_gradients(&mut grads, &vars, max_norm / norm)?;
            }
        }

        self.optimizer.step(&grads)?;
        self.global_step += 1;
        Ok(())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P, tag: &str) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.safetensors", tag));
        self.var_map.save(&path)?;
        Ok(path)
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &AutoregressiveWrapper {
        &self.model
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn local_rank(&self) -> usize {
        self.dist.rank
    }

    pub fn is_primary(&self) -> bool {
        self.dist.is_main_process()
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

fn scale_gradients(grads: &mut GradStore, vars: &[Var], scale: f64) -> Result<()> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let scaled = grad.affine(scale, 0.0)?;
        grads.insert(var.as_tensor(), scaled);
    }
    Ok(())
}

fn global_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// This rank's share of one pass over the dataset, as freshly sampled batches.
///
/// Each rank gets `ceil(len / world_size)` samples; the last batch is short
/// when the share does not divide evenly.
pub struct TrainLoader {
    dataset: TextSamplerDataset,
    batch_size: usize,
    shard_len: usize,
    num_batches: usize,
    position: usize,
    device: Device,
    rng: StdRng,
}

impl TrainLoader {
    pub fn new(
        dataset: TextSamplerDataset,
        batch_size: usize,
        world_size: usize,
        device: Device,
    ) -> Self {
        let shard_len = dataset.len().div_ceil(world_size.max(1));
        let num_batches = shard_len.div_ceil(batch_size.max(1));
        Self {
            dataset,
            batch_size,
            shard_len,
            num_batches,
            position: 0,
            device,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Iterator for TrainLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.num_batches {
            return None;
        }
        let size = self
            .batch_size
            .min(self.shard_len - self.position * self.batch_size);
        self.position += 1;
        Some(self.dataset.batch(size, &mut self.rng, &self.device))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.position;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::RoutingTransformerLM;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use std::sync::Arc;

    fn dataset(len: usize, seq_len: usize) -> TextSamplerDataset {
        let data: Vec<u8> = (0..len).map(|i| b"abcdefgh ijklmnop\n"[i % 18]).collect();
        TextSamplerDataset::new(Arc::from(data), seq_len)
    }

    fn engine(config: EngineConfig) -> (Engine, TrainLoader) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let net = RoutingTransformerLM::new(&Config::nano(), vb).unwrap();
        initialize(
            config,
            DistributedConfig::default(),
            AutoregressiveWrapper::new(net),
            var_map,
            dataset(2000, 16),
            2,
            Device::Cpu,
        )
        .unwrap()
    }

    fn lm_head(engine: &Engine) -> Vec<f32> {
        let data = engine.var_map().data().lock().unwrap();
        data["lm_head.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_loader_counts_and_shapes() {
        let (_engine, loader) = engine(EngineConfig::default());
        // 125 windows of 16 tokens, in batches of two with a short last one
        assert_eq!(loader.num_batches(), 63);
        assert_eq!(loader.batch_size(), 2);

        let batches: Vec<Batch> = loader.with_seed(4).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 63);
        assert_eq!(batches[0].tokens.dims(), &[2, 17]);
        assert_eq!(batches[0].mask.dims(), &[2, 17]);
        assert_eq!(batches[62].tokens.dims(), &[1, 17]);
    }

    #[test]
    fn test_loader_shards_across_world() {
        // 125 windows over 4 ranks is 32 each
        let loader = TrainLoader::new(dataset(2000, 16), 2, 4, Device::Cpu);
        assert_eq!(loader.num_batches(), 16);
        let sizes: Vec<usize> = loader.map(|b| b.unwrap().batch_size()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 32);

        let loader = TrainLoader::new(dataset(2000, 16), 3, 4, Device::Cpu);
        let sizes: Vec<usize> = loader.map(|b| b.unwrap().batch_size()).collect();
        assert_eq!(sizes.len(), 11);
        assert_eq!(sizes[10], 2);
    }

    #[test]
    fn test_micro_batch_override() {
        let (_engine, loader) = engine(EngineConfig {
            train_micro_batch_size_per_gpu: Some(5),
            ..Default::default()
        });
        assert_eq!(loader.batch_size(), 5);
        assert_eq!(loader.num_batches(), 25);
    }

    #[test]
    fn test_step_updates_parameters() {
        let (mut engine, loader) = engine(EngineConfig {
            optimizer: crate::config::OptimizerConfig {
                lr: 1e-2,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(0);
        let batch = loader.with_seed(1).next().unwrap().unwrap();
        let before = lm_head(&engine);

        engine.train();
        let loss = engine.forward_loss(&batch, true, &mut rng).unwrap();
        engine.backward(&loss).unwrap();
        engine.step().unwrap();

        assert_eq!(engine.global_step(), 1);
        assert_ne!(before, lm_head(&engine));
    }

    #[test]
    fn test_gradient_accumulation_defers_step() {
        let (mut engine, loader) = engine(EngineConfig {
            gradient_accumulation_steps: 2,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(0);
        let mut loader = loader.with_seed(2);
        let before = lm_head(&engine);

        for expected_steps in [0, 1] {
            let batch = loader.next().unwrap().unwrap();
            let loss = engine.forward_loss(&batch, false, &mut rng).unwrap();
            engine.backward(&loss).unwrap();
            engine.step().unwrap();
            assert_eq!(engine.global_step(), expected_steps);
            if expected_steps == 0 {
                assert_eq!(before, lm_head(&engine));
            }
        }
        assert_ne!(before, lm_head(&engine));
    }

    #[test]
    fn test_eval_loss_is_detached() {
        let (mut engine, loader) = engine(EngineConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let batch = loader.with_seed(3).next().unwrap().unwrap();

        engine.eval();
        assert_eq!(engine.mode(), Mode::Eval);
        let loss = engine.forward_loss(&batch, false, &mut rng).unwrap();
        assert!(!loss.is_variable());
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _loader) = engine(EngineConfig::default());
        let path = engine.save_checkpoint(dir.path(), "step_0").unwrap();
        assert!(path.ends_with("step_0.safetensors"));
        assert!(path.exists());
        engine.load_checkpoint(&path).unwrap();
    }

    #[cfg(not(feature = "nccl"))]
    #[test]
    fn test_distributed_needs_nccl() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let net = RoutingTransformerLM::new(&Config::nano(), vb).unwrap();
        let result = initialize(
            EngineConfig::default(),
            DistributedConfig {
                world_size: 2,
                ..Default::default()
            },
            AutoregressiveWrapper::new(net),
            var_map,
            dataset(2000, 16),
            2,
            Device::Cpu,
        );
        assert!(matches!(result, Err(Error::Distributed(_))));
    }
}
