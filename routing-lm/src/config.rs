use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tokenizer::VOCAB_SIZE;

/// Routing transformer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vocabulary size
    pub num_tokens: usize,
    /// Embedding dimension
    pub dim: usize,
    /// Number of blocks
    pub depth: usize,
    /// Total attention heads per block (local + routed)
    pub heads: usize,
    /// Maximum sequence length (context window)
    pub max_seq_len: usize,
    /// Local attention block size; also the expected routed cluster size
    pub window_size: usize,
    /// Heads using local attention, the rest are routed
    pub n_local_attn_heads: usize,
    /// Use reversible two-stream coupling between blocks
    pub reversible: bool,
    /// Number of sequence chunks the feed-forward is applied over
    pub ff_chunks: usize,
    /// Feed-forward hidden size as a multiple of `dim`
    pub ff_mult: usize,
    pub attn_dropout: f64,
    pub ff_dropout: f64,
    pub layer_norm_eps: f64,
    /// RoPE base frequency
    pub rope_theta: f64,
    /// Weight of the routing commitment loss
    pub commitment_weight: f64,
}

impl Config {
    /// The enwik8 character model: 6 layers, 512 wide, 4096 context.
    pub fn enwik8() -> Self {
        Self {
            num_tokens: VOCAB_SIZE,
            dim: 512,
            depth: 6,
            heads: 8,
            max_seq_len: 4096,
            window_size: 128,
            n_local_attn_heads: 4,
            reversible: true,
            ff_chunks: 40,
            ff_mult: 4,
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            commitment_weight: 1e-4,
        }
    }

    /// Nano configuration - fastest for testing
    pub fn nano() -> Self {
        Self {
            num_tokens: VOCAB_SIZE,
            dim: 32,
            depth: 2,
            heads: 4,
            max_seq_len: 64,
            window_size: 8,
            n_local_attn_heads: 2,
            reversible: true,
            ff_chunks: 4,
            ff_mult: 2,
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            commitment_weight: 1e-4,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.heads
    }

    pub fn num_routed_heads(&self) -> usize {
        self.heads - self.n_local_attn_heads
    }

    /// Number of routing centroids per head.
    pub fn num_clusters(&self) -> usize {
        (self.max_seq_len / self.window_size).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heads == 0 || self.dim % self.heads != 0 {
            return Err(Error::Config(format!(
                "dim {} is not divisible by {} heads",
                self.dim, self.heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config(format!(
                "head dimension {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if self.n_local_attn_heads > self.heads {
            return Err(Error::Config(format!(
                "{} local heads requested but only {} heads exist",
                self.n_local_attn_heads, self.heads
            )));
        }
        if self.window_size == 0 || self.ff_chunks == 0 || self.max_seq_len == 0 {
            return Err(Error::Config(
                "window_size, ff_chunks and max_seq_len must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Cadence of the training loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Tokens per training window (samples carry one extra)
    pub seq_len: usize,
    /// Run a validation sample every N steps
    pub validate_every: usize,
    /// Print a generated continuation every N steps (primary rank only)
    pub generate_every: usize,
    /// Tokens generated per sample
    pub generate_length: usize,
    pub temperature: f64,
    /// Fraction of logits dropped by top-k filtering during generation
    pub filter_thres: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seq_len: 4096,
            validate_every: 100,
            generate_every: 500,
            generate_length: 1024,
            temperature: 1.0,
            filter_thres: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 2.5e-4,
            betas: [0.9, 0.999],
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Engine settings read from the `--engine_config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides `--batch_size` when set
    pub train_micro_batch_size_per_gpu: Option<usize>,
    pub gradient_accumulation_steps: usize,
    /// Global gradient norm limit, 0 disables clipping
    pub gradient_clipping: f64,
    pub optimizer: OptimizerConfig,
    /// Directory for periodic safetensors checkpoints
    pub checkpoint_dir: Option<PathBuf>,
    /// Save every N steps when `checkpoint_dir` is set, 0 disables
    pub save_every: usize,
    /// Checkpoint to restore parameters from before training
    pub load_checkpoint: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            train_micro_batch_size_per_gpu: None,
            gradient_accumulation_steps: 1,
            gradient_clipping: 0.5,
            optimizer: OptimizerConfig::default(),
            checkpoint_dir: None,
            save_every: 0,
            load_checkpoint: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        if config.gradient_accumulation_steps == 0 {
            return Err(Error::Config(
                "gradient_accumulation_steps must be at least 1".into(),
            ));
        }
        Ok(config)
    }
}
