use candle_core::{Device, Tensor};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io as file_io;

/// Where the corpus is cut into train and validation bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusSplit {
    /// Decompressed bytes read from the start of the corpus
    pub max_bytes: usize,
    /// Leading bytes used for training; the remainder validates
    pub train_bytes: usize,
}

impl CorpusSplit {
    pub fn validation_bytes(&self) -> usize {
        self.max_bytes - self.train_bytes
    }
}

impl Default for CorpusSplit {
    fn default() -> Self {
        Self {
            max_bytes: 95_000_000,
            train_bytes: 90_000_000,
        }
    }
}

/// The corpus after loading: two disjoint, contiguous byte ranges.
pub struct Corpus {
    train: Arc<[u8]>,
    validation: Arc<[u8]>,
}

impl Corpus {
    /// Load the corpus prefix from a (possibly compressed) file.
    /// Supports .gz and .zst/.zstd compressed files.
    pub fn load<P: AsRef<Path>>(path: P, split: CorpusSplit) -> Result<Self> {
        check_split(split)?;
        let bytes = file_io::read_prefix(path, split.max_bytes)?;
        Self::from_bytes(&bytes, split)
    }

    pub fn from_bytes(bytes: &[u8], split: CorpusSplit) -> Result<Self> {
        check_split(split)?;
        if bytes.len() < split.max_bytes {
            return Err(Error::CorpusTruncated {
                expected: split.max_bytes,
                actual: bytes.len(),
            });
        }
        let (train, rest) = bytes.split_at(split.train_bytes);
        let validation = &rest[..split.validation_bytes()];
        Ok(Self {
            train: Arc::from(train),
            validation: Arc::from(validation),
        })
    }

    pub fn train(&self) -> Arc<[u8]> {
        Arc::clone(&self.train)
    }

    pub fn validation(&self) -> Arc<[u8]> {
        Arc::clone(&self.validation)
    }
}

fn check_split(split: CorpusSplit) -> Result<()> {
    if split.train_bytes > split.max_bytes {
        return Err(Error::InvalidSplit {
            train: split.train_bytes,
            total: split.max_bytes,
        });
    }
    Ok(())
}

/// One training example: `seq_len + 1` tokens and a matching all-true mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub tokens: Vec<u32>,
    pub mask: Vec<bool>,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Random fixed-length windows over a byte buffer.
///
/// Indexing is only nominal: every draw picks a fresh uniform start offset.
pub struct TextSamplerDataset {
    data: Arc<[u8]>,
    seq_len: usize,
}

impl TextSamplerDataset {
    pub fn new(data: Arc<[u8]>, seq_len: usize) -> Self {
        Self { data, seq_len }
    }

    /// Number of non-overlapping windows that fit in the buffer.
    pub fn len(&self) -> usize {
        self.data.len() / self.seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Uniform start offset in `[0, len - seq_len - 1)`.
    pub fn random_start<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<usize> {
        let upper = self
            .data
            .len()
            .checked_sub(self.seq_len + 1)
            .filter(|&upper| upper > 0)
            .ok_or_else(|| Error::WindowTooLarge {
                len: self.data.len(),
                window: self.seq_len,
            })?;
        Ok(rng.random_range(0..upper))
    }

    /// The `seq_len + 1` tokens starting at `start`, if they fit.
    pub fn window_at(&self, start: usize) -> Option<Sample> {
        let bytes = self.data.get(start..start + self.seq_len + 1)?;
        Some(Sample {
            tokens: bytes.iter().map(|&b| u32::from(b)).collect(),
            mask: vec![true; bytes.len()],
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Sample> {
        let start = self.random_start(rng)?;
        self.window_at(start).ok_or_else(|| Error::WindowTooLarge {
            len: self.data.len(),
            window: self.seq_len,
        })
    }

    /// Random access by index; the index does not influence the window.
    pub fn get<R: Rng + ?Sized>(&self, _index: usize, rng: &mut R) -> Result<Sample> {
        self.sample(rng)
    }

    pub fn batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Batch> {
        let samples = (0..batch_size)
            .map(|_| self.sample(rng))
            .collect::<Result<Vec<_>>>()?;
        Batch::from_samples(&samples, device)
    }
}

/// Stacked samples: `u32` tokens and `u8` mask, both `[batch, seq_len + 1]`.
pub struct Batch {
    pub tokens: Tensor,
    pub mask: Tensor,
}

impl Batch {
    pub fn from_samples(samples: &[Sample], device: &Device) -> Result<Self> {
        let batch_size = samples.len();
        let width = samples.first().map_or(0, Sample::len);

        let mut token_data = Vec::with_capacity(batch_size * width);
        let mut mask_data = Vec::with_capacity(batch_size * width);
        for sample in samples {
            token_data.extend_from_slice(&sample.tokens);
            mask_data.extend(sample.mask.iter().map(|&m| u8::from(m)));
        }

        let tokens = Tensor::from_vec(token_data, (batch_size, width), device)?;
        let mask = Tensor::from_vec(mask_data, (batch_size, width), device)?;
        Ok(Self { tokens, mask })
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.dims().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn ramp(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_default_split_sizes() {
        let split = CorpusSplit::default();
        assert_eq!(split.train_bytes, 90_000_000);
        assert_eq!(split.validation_bytes(), 5_000_000);
    }

    #[test]
    fn test_split_is_disjoint_and_contiguous() {
        let bytes: Vec<u8> = (0..1200).map(|i| (i % 251) as u8).collect();
        let split = CorpusSplit {
            max_bytes: 950,
            train_bytes: 900,
        };
        let corpus = Corpus::from_bytes(&bytes, split).unwrap();
        assert_eq!(corpus.train().len(), 900);
        assert_eq!(corpus.validation().len(), 50);
        assert_eq!(&corpus.train()[..], &bytes[..900]);
        assert_eq!(&corpus.validation()[..], &bytes[900..950]);
    }

    #[test]
    fn test_load_gzip_corpus() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enwik8.gz");
        let bytes: Vec<u8> = (0..2000).map(|i| (i % 256) as u8).collect();
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();

        let split = CorpusSplit {
            max_bytes: 1900,
            train_bytes: 1800,
        };
        let corpus = Corpus::load(&path, split).unwrap();
        assert_eq!(&corpus.train()[..], &bytes[..1800]);
        assert_eq!(&corpus.validation()[..], &bytes[1800..1900]);
    }

    #[test]
    fn test_short_corpus_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.txt");
        std::fs::write(&path, vec![b'a'; 100]).unwrap();

        let split = CorpusSplit {
            max_bytes: 200,
            train_bytes: 150,
        };
        match Corpus::load(&path, split) {
            Err(Error::CorpusTruncated { expected, actual }) => {
                assert_eq!(expected, 200);
                assert_eq!(actual, 100);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_split() {
        let split = CorpusSplit {
            max_bytes: 10,
            train_bytes: 11,
        };
        assert!(matches!(
            Corpus::from_bytes(&[0; 20], split),
            Err(Error::InvalidSplit { .. })
        ));
    }

    #[test]
    fn test_sampler_len_counts_whole_windows() {
        let dataset = TextSamplerDataset::new(ramp(5000), 100);
        assert_eq!(dataset.len(), 50);
        let dataset = TextSamplerDataset::new(ramp(5099), 100);
        assert_eq!(dataset.len(), 50);
    }

    #[test]
    fn test_samples_have_window_plus_one_tokens() {
        let data = ramp(5000);
        let dataset = TextSamplerDataset::new(Arc::clone(&data), 100);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let start = dataset.random_start(&mut rng).unwrap();
            assert!(start < 4899);

            let sample = dataset.window_at(start).unwrap();
            assert_eq!(sample.len(), 101);
            assert_eq!(sample.mask, vec![true; 101]);
            let expected: Vec<u32> = data[start..start + 101].iter().map(|&b| b as u32).collect();
            assert_eq!(sample.tokens, expected);
        }

        let sample = dataset.get(3, &mut rng).unwrap();
        assert_eq!(sample.tokens.len(), 101);
        assert!(sample.mask.iter().all(|&m| m));
    }

    #[test]
    fn test_smallest_valid_buffer_always_starts_at_zero() {
        let dataset = TextSamplerDataset::new(ramp(102), 100);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(dataset.random_start(&mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_window_too_large_fails_fast() {
        let mut rng = StdRng::seed_from_u64(1);
        for len in [0, 50, 100, 101] {
            let dataset = TextSamplerDataset::new(ramp(len), 100);
            assert!(matches!(
                dataset.sample(&mut rng),
                Err(Error::WindowTooLarge { window: 100, .. })
            ));
        }
    }

    #[test]
    fn test_window_at_out_of_range() {
        let dataset = TextSamplerDataset::new(ramp(200), 100);
        assert!(dataset.window_at(99).is_some());
        assert!(dataset.window_at(100).is_none());
    }

    #[test]
    fn test_batch_shapes() {
        let dataset = TextSamplerDataset::new(ramp(1000), 16);
        let mut rng = StdRng::seed_from_u64(3);
        let batch = dataset.batch(3, &mut rng, &Device::Cpu).unwrap();

        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.tokens.dims(), &[3, 17]);
        assert_eq!(batch.tokens.dtype(), DType::U32);
        assert_eq!(batch.mask.dtype(), DType::U8);
        let mask: Vec<Vec<u8>> = batch.mask.to_vec2().unwrap();
        assert!(mask.iter().flatten().all(|&m| m == 1));
    }
}
