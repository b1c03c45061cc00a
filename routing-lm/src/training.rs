use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;

use crate::config::TrainingConfig;
use crate::data::{Batch, TextSamplerDataset};
use crate::engine::{Engine, TrainLoader};
use crate::tokenizer::decode_tokens;

/// A primed validation window and the model's continuation, both decoded.
pub struct GeneratedSample {
    pub prime: String,
    pub output: String,
}

/// Steps at which a run validated and printed samples.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: usize,
    pub validated: Vec<usize>,
    pub generated: Vec<usize>,
}

pub struct Trainer {
    engine: Engine,
    val_dataset: TextSamplerDataset,
    config: TrainingConfig,
    rng: StdRng,
}

impl Trainer {
    pub fn new(engine: Engine, val_dataset: TextSamplerDataset, config: TrainingConfig) -> Self {
        Self {
            engine,
            val_dataset,
            config,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn should_validate(&self, step: usize) -> bool {
        step % self.config.validate_every == 0
    }

    /// Samples are printed by the primary rank only, never at step 0.
    pub fn should_generate(&self, step: usize) -> bool {
        step != 0 && self.engine.is_primary() && step % self.config.generate_every == 0
    }

    /// Train until the loader runs dry.
    pub fn run(&mut self, loader: TrainLoader) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let pb = if self.engine.is_primary() {
            ProgressBar::new(loader.num_batches() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")?
                .progress_chars("##-"),
        );

        for (i, batch) in loader.enumerate() {
            let loss = self.train_step(&batch?)?;
            pb.suspend(|| println!("{}", loss));
            pb.set_message(format!("{:.4}", loss));
            pb.inc(1);

            summary.steps += 1;

            if self.should_validate(i) {
                let val_loss = self.validate()?;
                pb.suspend(|| println!("validation loss: {}", val_loss));
                summary.validated.push(i);
            }

            if self.should_generate(i) {
                let sample = self.generate_sample()?;
                pb.suspend(|| {
                    println!("{}\n\n{}", sample.prime, "*".repeat(100));
                    println!("{}", sample.output);
                });
                summary.generated.push(i);
            }

            self.maybe_checkpoint(i)?;
        }

        pb.finish_with_message("done");
        info!(steps = self.engine.global_step(), "training data exhausted");
        Ok(summary)
    }

    /// One forward/backward/step on a training batch; returns the loss.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        self.engine.train();
        let loss = self.engine.forward_loss(batch, true, &mut self.rng)?;
        let value = loss.to_scalar::<f32>()?;
        self.engine.backward(&loss)?;
        self.engine.step()?;
        Ok(value)
    }

    /// Loss on one random validation window.
    pub fn validate(&mut self) -> Result<f32> {
        self.engine.eval();
        let sample = self.val_dataset.sample(&mut self.rng)?;
        let batch = Batch::from_samples(&[sample], self.engine.device())?;
        let loss = self.engine.forward_loss(&batch, false, &mut self.rng)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    pub fn generate_sample(&mut self) -> Result<GeneratedSample> {
        self.engine.eval();
        let sample = self.val_dataset.sample(&mut self.rng)?;
        let output = self.engine.model().generate(
            &sample.tokens,
            self.config.generate_length,
            self.config.temperature,
            self.config.filter_thres,
            &mut self.rng,
        )?;
        Ok(GeneratedSample {
            prime: decode_tokens(&sample.tokens),
            output: decode_tokens(&output),
        })
    }

    fn maybe_checkpoint(&self, step: usize) -> Result<()> {
        let config = self.engine.config();
        let Some(dir) = &config.checkpoint_dir else {
            return Ok(());
        };
        if config.save_every == 0 || step == 0 || step % config.save_every != 0 {
            return Ok(());
        }
        if self.engine.is_primary() {
            let path = self.engine.save_checkpoint(dir, &format!("step_{}", step))?;
            info!(path = %path.display(), "saved checkpoint");
        }
        Ok(())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoregressive::AutoregressiveWrapper;
    use crate::config::{Config, EngineConfig};
    use crate::distributed::DistributedConfig;
    use crate::engine;
    use crate::model::RoutingTransformerLM;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use std::sync::Arc;

    fn corpus(len: usize) -> Arc<[u8]> {
        let text = b"<page><title>Anarchism</title>\n<text>Anarchism is a political philosophy.</text></page>\n";
        (0..len).map(|i| text[i % text.len()]).collect::<Vec<_>>().into()
    }

    fn trainer(engine_config: EngineConfig) -> (Trainer, TrainLoader) {
        trainer_on_rank(engine_config, DistributedConfig::default())
    }

    fn trainer_on_rank(
        engine_config: EngineConfig,
        dist: DistributedConfig,
    ) -> (Trainer, TrainLoader) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let net = RoutingTransformerLM::new(&Config::nano(), vb).unwrap();
        let (engine, loader) = engine::initialize(
            engine_config,
            dist,
            AutoregressiveWrapper::new(net),
            var_map,
            TextSamplerDataset::new(corpus(400), 16),
            2,
            Device::Cpu,
        )
        .unwrap();

        let config = TrainingConfig {
            seq_len: 16,
            validate_every: 2,
            generate_every: 3,
            generate_length: 4,
            ..Default::default()
        };
        let trainer = Trainer::new(engine, TextSamplerDataset::new(corpus(200), 16), config);
        (trainer.with_seed(7), loader.with_seed(8))
    }

    #[test]
    fn test_run_consumes_loader() {
        let (mut trainer, loader) = trainer(EngineConfig::default());
        assert_eq!(loader.num_batches(), 13);
        let summary = trainer.run(loader).unwrap();
        assert_eq!(summary.steps, 13);
        assert_eq!(trainer.engine().global_step(), 13);
        assert_eq!(summary.validated, vec![0, 2, 4, 6, 8, 10, 12]);
        assert_eq!(summary.generated, vec![3, 6, 9, 12]);
    }

    #[test]
    fn test_cadence_on_primary_rank() {
        let (trainer, _loader) = trainer(EngineConfig::default());
        assert!(trainer.should_validate(0));
        assert!(trainer.should_validate(2));
        assert!(!trainer.should_validate(3));
        assert!(trainer.should_validate(6));

        assert!(!trainer.should_generate(0));
        assert!(!trainer.should_generate(2));
        assert!(trainer.should_generate(3));
        assert!(trainer.should_generate(6));
    }

    #[test]
    fn test_other_ranks_validate_but_never_generate() {
        let dist = DistributedConfig {
            rank: 1,
            ..Default::default()
        };
        let (mut trainer, loader) = trainer_on_rank(EngineConfig::default(), dist);
        assert!(!trainer.engine().is_primary());
        for step in [0, 2, 3, 6] {
            assert!(!trainer.should_generate(step));
        }

        let summary = trainer.run(loader).unwrap();
        assert_eq!(summary.validated, vec![0, 2, 4, 6, 8, 10, 12]);
        assert!(summary.generated.is_empty());
    }

    #[test]
    fn test_validate_leaves_parameters_alone() {
        let (mut trainer, _loader) = trainer(EngineConfig::default());
        let loss = trainer.validate().unwrap();
        assert!(loss.is_finite());
        assert_eq!(trainer.engine().global_step(), 0);
    }

    #[test]
    fn test_generated_sample_is_printable() {
        let (mut trainer, _loader) = trainer(EngineConfig::default());
        let sample = trainer.generate_sample().unwrap();
        assert_eq!(sample.prime.chars().count(), 17);
        assert_eq!(sample.output.chars().count(), 4);
        assert!(sample.prime.chars().all(|c| c as u32 >= 32));
        assert!(!sample.prime.contains('\n'));
    }

    #[test]
    fn test_periodic_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, loader) = trainer(EngineConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            save_every: 5,
            ..Default::default()
        });
        trainer.run(loader).unwrap();
        assert!(dir.path().join("step_5.safetensors").exists());
        assert!(dir.path().join("step_10.safetensors").exists());
        assert!(!dir.path().join("step_0.safetensors").exists());
    }
}
