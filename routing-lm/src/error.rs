//! Error types for routing-lm

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corpus truncated: expected {expected} bytes, got {actual}")]
    CorpusTruncated { expected: usize, actual: usize },

    #[error("Invalid corpus split: train range of {train} bytes exceeds total of {total}")]
    InvalidSplit { train: usize, total: usize },

    #[error("Corpus of {len} bytes is too short for windows of {window} tokens")]
    WindowTooLarge { len: usize, window: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Distributed error: {0}")]
    Distributed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
