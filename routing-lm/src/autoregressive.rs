//! Next-token loss and sampling on top of the language model.

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{RoutingTransformerLM, cross_entropy_loss, masked_cross_entropy};

/// Chance that a loss call with truncation enabled actually shortens the batch.
pub const TRUNCATE_PROBABILITY: f64 = 0.5;

pub struct AutoregressiveWrapper {
    net: RoutingTransformerLM,
}

impl AutoregressiveWrapper {
    pub fn new(net: RoutingTransformerLM) -> Self {
        Self { net }
    }

    pub fn net(&self) -> &RoutingTransformerLM {
        &self.net
    }

    pub fn config(&self) -> &Config {
        self.net.config()
    }

    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (logits, _) = self.net.forward(input_ids, train)?;
        Ok(logits)
    }

    /// Loss of predicting `tokens[:, 1:]` from `tokens[:, :-1]`.
    ///
    /// With `randomly_truncate`, both sides are cut to a random length in
    /// `[1, seq_len)` with probability [`TRUNCATE_PROBABILITY`]. Positions
    /// whose target mask is zero do not count.
    pub fn loss<R: Rng + ?Sized>(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        randomly_truncate: bool,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let (_, width) = tokens.dims2()?;
        if width < 2 {
            return Err(Error::Config(format!(
                "need at least two tokens per row to form a target, got {}",
                width
            )));
        }

        let mut seq_len = width - 1;
        if randomly_truncate && seq_len > 1 && rng.random::<f64>() < TRUNCATE_PROBABILITY {
            seq_len = rng.random_range(1..seq_len);
        }

        let input = tokens.narrow(1, 0, seq_len)?;
        let target = tokens.narrow(1, 1, seq_len)?.contiguous()?;
        let (logits, aux) = self.net.forward(&input, train)?;

        let loss = match mask {
            Some(mask) => {
                let target_mask = mask.narrow(1, 1, seq_len)?;
                masked_cross_entropy(&logits, &target, &target_mask)?
            }
            None => cross_entropy_loss(&logits, &target)?,
        };
        let aux = aux.affine(self.config().commitment_weight, 0.0)?;
        Ok((loss + aux)?)
    }

    /// Samples `length` tokens after `prime`, returning only the new ones.
    ///
    /// The context fed to the model is the last `max_seq_len` tokens. Logits
    /// are cut to the top `(1 - filter_thres)` fraction before sampling.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prime: &[u32],
        length: usize,
        temperature: f64,
        filter_thres: f64,
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        if prime.is_empty() {
            return Err(Error::Config("generation needs at least one prime token".into()));
        }
        if temperature <= 0.0 {
            return Err(Error::Config(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }

        let device = self.net.device();
        let max_seq_len = self.config().max_seq_len;
        let k = top_k_count(filter_thres, self.config().num_tokens);
        let mut tokens = prime.to_vec();

        for _ in 0..length {
            let context_len = tokens.len().min(max_seq_len);
            let context = &tokens[tokens.len() - context_len..];

            let input = Tensor::new(context, device)?.unsqueeze(0)?;
            let logits = self.forward(&input, false)?;
            // Shape: [1, seq_len, vocab] -> [vocab]
            let logits = logits
                .narrow(1, context_len - 1, 1)?
                .squeeze(1)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            let logits = top_k_filter(&logits, k, device)?;
            let logits = if temperature != 1.0 {
                logits.affine(1.0 / temperature, 0.0)?
            } else {
                logits
            };

            tokens.push(sample_from_logits(&logits, rng)?);
        }

        Ok(tokens.split_off(prime.len()))
    }
}

/// Number of logits kept for a filter threshold, at least one.
pub fn top_k_count(filter_thres: f64, num_logits: usize) -> usize {
    (((1.0 - filter_thres) * num_logits as f64) as usize).clamp(1, num_logits)
}

/// Apply top-k filtering to logits.
fn top_k_filter(logits: &Tensor, k: usize, device: &Device) -> Result<Tensor> {
    let logits_vec: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = logits_vec.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut masked = vec![f32::NEG_INFINITY; logits_vec.len()];
    for &(i, value) in indexed.iter().take(k) {
        masked[i] = value;
    }

    Ok(Tensor::new(masked, device)?)
}

/// Sample a token from logits using the probability distribution.
fn sample_from_logits<R: Rng + ?Sized>(logits: &Tensor, rng: &mut R) -> Result<u32> {
    let probs = candle_nn::ops::softmax_last_dim(logits)?;
    let probs_vec: Vec<f32> = probs.to_vec1()?;

    let r: f32 = rng.random();
    let mut cumulative = 0.0;
    let mut last_candidate = 0;
    for (i, &p) in probs_vec.iter().enumerate() {
        if p > 0.0 {
            last_candidate = i;
        }
        cumulative += p;
        if cumulative > r {
            return Ok(i as u32);
        }
    }
    // rounding left the cumulative sum just below r
    Ok(last_candidate as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn wrapper() -> (VarMap, AutoregressiveWrapper) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let net = RoutingTransformerLM::new(&Config::nano(), vb).unwrap();
        (var_map, AutoregressiveWrapper::new(net))
    }

    fn batch(rows: usize, width: usize) -> Tensor {
        let data: Vec<u32> = (0..rows * width).map(|i| (i * 31 % 256) as u32).collect();
        Tensor::from_vec(data, (rows, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_top_k_count() {
        assert_eq!(top_k_count(0.9, 256), 25);
        assert_eq!(top_k_count(0.0, 256), 256);
        assert_eq!(top_k_count(1.0, 256), 1);
    }

    #[test]
    fn test_loss_is_finite_scalar() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(0);
        let tokens = batch(2, 17);
        let mask = Tensor::ones((2, 17), DType::U8, &Device::Cpu).unwrap();

        let loss = model.loss(&tokens, Some(&mask), false, true, &mut rng).unwrap();
        assert_eq!(loss.rank(), 0);
        let value: f32 = loss.to_scalar().unwrap();
        assert!(value.is_finite());
        // an untrained byte model sits near ln(256)
        assert!(value > 3.0 && value < 8.0, "loss {}", value);
    }

    #[test]
    fn test_truncated_loss_is_finite() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(11);
        let tokens = batch(2, 33);
        for _ in 0..8 {
            let loss = model.loss(&tokens, None, true, true, &mut rng).unwrap();
            assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        }
    }

    #[test]
    fn test_loss_needs_two_tokens() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(model.loss(&batch(1, 1), None, false, false, &mut rng).is_err());
    }

    #[test]
    fn test_generate_returns_only_new_tokens() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(5);
        let prime: Vec<u32> = b"<page>".iter().map(|&b| b as u32).collect();

        let sampled = model.generate(&prime, 12, 1.0, 0.9, &mut rng).unwrap();
        assert_eq!(sampled.len(), 12);
        assert!(sampled.iter().all(|&t| t < 256));
    }

    #[test]
    fn test_generate_with_prime_longer_than_context() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(9);
        let prime: Vec<u32> = (0..100).map(|i| i % 256).collect();

        let sampled = model.generate(&prime, 3, 0.8, 0.9, &mut rng).unwrap();
        assert_eq!(sampled.len(), 3);
    }

    #[test]
    fn test_generate_rejects_bad_arguments() {
        let (_vm, model) = wrapper();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(model.generate(&[], 3, 1.0, 0.9, &mut rng).is_err());
        assert!(model.generate(&[65], 3, 0.0, 0.9, &mut rng).is_err());
    }

    #[test]
    fn test_sampling_respects_top_k() {
        let mut rng = StdRng::seed_from_u64(2);
        let logits = Tensor::new(&[0.0f32, 5.0, 1.0, 4.0], &Device::Cpu).unwrap();
        let filtered = top_k_filter(&logits, 2, &Device::Cpu).unwrap();
        for _ in 0..50 {
            let token = sample_from_logits(&filtered, &mut rng).unwrap();
            assert!(token == 1 || token == 3);
        }
    }
}
