use clap::Parser;
use std::path::PathBuf;

use crate::engine::EngineArgs;

/// Train a routing transformer on enwik8
#[derive(Debug, Parser)]
#[command(name = "routing-lm")]
#[command(about = "Character-level routing transformer training on enwik8")]
pub struct Args {
    /// Use CUDA (or Metal) if the binary was built with GPU support
    #[arg(long = "with_cuda")]
    pub with_cuda: bool,

    /// Accepted for launcher compatibility; has no effect
    #[arg(long = "use_ema")]
    pub use_ema: bool,

    /// Mini-batch size per process
    #[arg(short = 'b', long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    /// Number of passes over the training data
    #[arg(short = 'e', long = "epochs", default_value_t = 30)]
    pub epochs: usize,

    /// Local rank passed by the distributed launcher
    #[arg(
        long = "local_rank",
        env = "LOCAL_RANK",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub local_rank: i64,

    /// Path to the enwik8 corpus (.gz, .zst or raw)
    #[arg(long, default_value = "./data/enwik8.gz")]
    pub data: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,
}
