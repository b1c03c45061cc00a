pub mod autoregressive;
pub mod cli;
pub mod config;
pub mod data;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod io;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use autoregressive::AutoregressiveWrapper;
pub use config::{Config, EngineConfig, TrainingConfig};
pub use data::{Batch, Corpus, CorpusSplit, TextSamplerDataset};
pub use distributed::{DistributedConfig, NcclCommunicator};
pub use engine::{Engine, TrainLoader};
pub use error::{Error, Result};
pub use model::RoutingTransformerLM;
pub use training::Trainer;
