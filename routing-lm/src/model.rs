//! Routing transformer language model.
//!
//! Each block mixes two kinds of heads: local heads attend causally inside
//! fixed windows (plus one window of look-back), routed heads attend causally
//! to positions assigned to the same learned centroid. Blocks are stacked
//! either as plain pre-norm residuals or as reversible two-stream couplings.

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear, linear_no_bias};

use crate::config::Config;

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    let m = mask.where_cond(&on_true, on_false)?;
    Ok(m)
}

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.affine(1.0, 1e-12)?.sqrt()?;
    x.broadcast_div(&norm)
}

/// `[batch, seq, heads * head_dim]` -> `[batch, heads, seq, head_dim]`
fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch_size, seq_len, _) = x.dims3()?;
    x.reshape((batch_size, seq_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `[batch, heads, seq, head_dim]` -> `[batch, seq, heads * head_dim]`
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch_size, num_heads, seq_len, head_dim) = x.dims4()?;
    x.transpose(1, 2)?
        .contiguous()?
        .reshape((batch_size, seq_len, num_heads * head_dim))
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;
        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotates `[batch, heads, seq, head_dim]` by absolute position.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(3, 0, head_dim / 2)?;
        let x2 = x.narrow(3, head_dim / 2, head_dim / 2)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], 3)?;

        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// Causal attention inside windows of `window_size`, looking one window back.
pub struct LocalAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    window_size: usize,
    dropout: Dropout,
}

impl LocalAttention {
    pub fn new(config: &Config, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let inner = num_heads * head_dim;
        Ok(Self {
            q_proj: linear_no_bias(config.dim, inner, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(config.dim, inner, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.dim, inner, vb.pp("v_proj"))?,
            num_heads,
            head_dim,
            window_size: config.window_size,
            dropout: Dropout::new(config.attn_dropout as f32),
        })
    }

    pub fn forward(&self, x: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<Tensor> {
        let q = split_heads(&self.q_proj.forward(x)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(x)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, self.num_heads, self.head_dim)?;

        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        #[cfg(feature = "flash-attn")]
        if q.device().is_cuda() {
            return self.flash_forward(&q, &k, &v);
        }

        self.blocked_forward(&q, &k, &v, train)
    }

    fn blocked_forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, num_heads, seq_len, head_dim) = q.dims4()?;
        let window = self.window_size;
        let windows = seq_len.div_ceil(window);
        let padded = windows * window;
        let pad = padded - seq_len;

        let blocks = |t: &Tensor| -> Result<Tensor> {
            let t = if pad > 0 {
                t.pad_with_zeros(2, 0, pad)?
            } else {
                t.clone()
            };
            t.reshape((batch_size * num_heads, windows, window, head_dim))
        };
        let q = blocks(q)?;
        let k = look_back(&blocks(k)?)?;
        let v = look_back(&blocks(v)?)?;

        let scale = (head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;

        let mask = local_mask(windows, window, q.device())?;
        let attn_weights = masked_fill(&attn_weights, &mask, f32::NEG_INFINITY)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let output = attn_weights.matmul(&v)?;
        let output = output
            .reshape((batch_size, num_heads, padded, head_dim))?
            .narrow(2, 0, seq_len)?;
        merge_heads(&output)
    }

    #[cfg(feature = "flash-attn")]
    fn flash_forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        // Flash attention expects (batch, seq, heads, head_dim) in half precision
        let dtype = q.dtype();
        let q = q.transpose(1, 2)?.to_dtype(DType::BF16)?;
        let k = k.transpose(1, 2)?.to_dtype(DType::BF16)?;
        let v = v.transpose(1, 2)?.to_dtype(DType::BF16)?;
        let softmax_scale = 1.0 / (self.head_dim as f32).sqrt();
        let attn = candle_flash_attn::flash_attn_windowed(
            &q,
            &k,
            &v,
            softmax_scale,
            Some(self.window_size),
            Some(0),
        )?;
        let (batch_size, seq_len, _, _) = attn.dims4()?;
        attn.to_dtype(dtype)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }
}

/// Prepends the previous window to every window: `[n, w, W, d]` -> `[n, w, 2W, d]`.
fn look_back(x: &Tensor) -> Result<Tensor> {
    let windows = x.dim(1)?;
    let previous = x.pad_with_zeros(1, 1, 0)?.narrow(1, 0, windows)?;
    Tensor::cat(&[&previous, x], 2)?.contiguous()
}

/// `[1, windows, W, 2W]`, 1 where a query may not see a key.
fn local_mask(windows: usize, window: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0u8; windows * window * 2 * window];
    for w in 0..windows {
        for i in 0..window {
            let query = w * window + i;
            for j in 0..2 * window {
                let before_start = w == 0 && j < window;
                let key = (w * window + j).saturating_sub(window);
                if before_start || key > query {
                    mask[(w * window + i) * 2 * window + j] = 1;
                }
            }
        }
    }
    Tensor::from_vec(mask, (1, windows, window, 2 * window), device)
}

/// Score given to a position attending to itself in a routed bucket, so it
/// only wins when nothing else is visible.
const SELF_ATTN_SCORE: f32 = -5e4;

/// Additive score bias for routed buckets.
///
/// `positions` is `[buckets, w]`, the sequence position of every bucket
/// member. The result is `[buckets, w, w]`: `-inf` for keys after the query,
/// [`SELF_ATTN_SCORE`] on the query itself and zero elsewhere.
fn bucket_bias(positions: &Tensor) -> Result<Tensor> {
    let (buckets, w) = positions.dims2()?;
    let query = positions.unsqueeze(2)?;
    let key = positions.unsqueeze(1)?;
    let zeros = Tensor::zeros((buckets, w, w), DType::F32, positions.device())?;
    let bias = masked_fill(&zeros, &key.broadcast_eq(&query)?, SELF_ATTN_SCORE)?;
    masked_fill(&bias, &key.broadcast_gt(&query)?, f32::NEG_INFINITY)
}

/// The `w` positions closest to each centroid: `[b, h, n, c]` -> `[b, h, c, w]`.
fn cluster_members(sims: &Tensor, w: usize) -> Result<Tensor> {
    sims.transpose(2, 3)?
        .contiguous()?
        .arg_sort_last_dim(false)?
        .narrow(3, 0, w)?
        .contiguous()
}

/// Averages `values` `[b, h, m, d]` back onto the `n` positions named by
/// `index` `[b, h, m]`. Positions picked by no bucket get zeros.
fn scatter_mean(values: &Tensor, index: &Tensor, n: usize) -> Result<Tensor> {
    let (b, h, m, d) = values.dims4()?;
    let device = values.device();
    let index = index.unsqueeze(3)?;
    let value_index = index.broadcast_as((b, h, m, d))?.contiguous()?;
    let summed = Tensor::zeros((b, h, n, d), values.dtype(), device)?.scatter_add(
        &value_index,
        values,
        2,
    )?;
    let counts = Tensor::zeros((b, h, n, 1), values.dtype(), device)?.scatter_add(
        &index.contiguous()?,
        &Tensor::ones((b, h, m, 1), values.dtype(), device)?,
        2,
    )?;
    summed.broadcast_div(&counts.maximum(1f32)?)
}

/// Content-based sparse attention over shared query/key vectors.
pub struct RoutingAttention {
    qk_proj: Linear,
    v_proj: Linear,
    means: Tensor,
    num_heads: usize,
    head_dim: usize,
    window_size: usize,
    dropout: Dropout,
}

impl RoutingAttention {
    pub fn new(config: &Config, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let inner = num_heads * head_dim;
        let means = vb.get_with_hints(
            (num_heads, config.num_clusters(), head_dim),
            "means",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            qk_proj: linear_no_bias(config.dim, inner, vb.pp("qk_proj"))?,
            v_proj: linear_no_bias(config.dim, inner, vb.pp("v_proj"))?,
            means,
            num_heads,
            head_dim,
            window_size: config.window_size,
            dropout: Dropout::new(config.attn_dropout as f32),
        })
    }

    /// Returns the attended values and the commitment loss of the routing.
    ///
    /// Every centroid gathers the `window_size` positions closest to it into
    /// a bucket; attention runs causally inside each bucket and the results
    /// are averaged back onto their positions.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_size, seq_len, _) = x.dims3()?;
        let (heads, head_dim) = (self.num_heads, self.head_dim);
        let qk = split_heads(&self.qk_proj.forward(x)?, heads, head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, heads, head_dim)?;
        let qk = rope.apply(&qk)?;

        // Cosine similarity to every centroid: [b, h, n, clusters]
        let unit = l2_normalize(&qk)?;
        let clusters = self.means.dim(1)?;
        let means_t = l2_normalize(&self.means)?
            .transpose(1, 2)?
            .unsqueeze(0)?
            .broadcast_as((batch_size, heads, head_dim, clusters))?
            .contiguous()?;
        let sims = unit.matmul(&means_t)?;

        // |u - c|^2 = 2 - 2 cos for unit vectors
        let best = sims.max_keepdim(D::Minus1)?;
        let commitment = best.affine(-2.0, 2.0)?.mean_all()?;

        let w = self.window_size.min(seq_len);
        let members = cluster_members(&sims, w)?.reshape((batch_size, heads, clusters * w))?;
        let gather_index = members
            .unsqueeze(3)?
            .broadcast_as((batch_size, heads, clusters * w, head_dim))?
            .contiguous()?;

        let buckets = batch_size * heads * clusters;
        let qk_b = qk.gather(&gather_index, 2)?.reshape((buckets, w, head_dim))?;
        let v_b = v.gather(&gather_index, 2)?.reshape((buckets, w, head_dim))?;

        let scale = (head_dim as f64).sqrt();
        let qk_t = qk_b.transpose(1, 2)?.contiguous()?;
        let attn_weights = qk_b.matmul(&qk_t)?.affine(1.0 / scale, 0.0)?;
        let bias = bucket_bias(&members.reshape((buckets, w))?)?;
        let attn_weights = attn_weights.broadcast_add(&bias.to_dtype(attn_weights.dtype())?)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let output = attn_weights
            .matmul(&v_b)?
            .reshape((batch_size, heads, clusters * w, head_dim))?;
        let output = scatter_mean(&output, &members, seq_len)?;
        Ok((merge_heads(&output)?, commitment))
    }
}

pub struct Attention {
    local: Option<LocalAttention>,
    routed: Option<RoutingAttention>,
    o_proj: Linear,
}

impl Attention {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let local = match config.n_local_attn_heads {
            0 => None,
            heads => Some(LocalAttention::new(config, heads, vb.pp("local"))?),
        };
        let routed = match config.num_routed_heads() {
            0 => None,
            heads => Some(RoutingAttention::new(config, heads, vb.pp("routed"))?),
        };
        let o_proj = linear(config.dim, config.dim, vb.pp("o_proj"))?;
        Ok(Self {
            local,
            routed,
            o_proj,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mut heads = Vec::with_capacity(2);
        let mut aux = Tensor::zeros((), DType::F32, x.device())?;

        if let Some(local) = &self.local {
            heads.push(local.forward(x, rope, train)?);
        }
        if let Some(routed) = &self.routed {
            let (out, commitment) = routed.forward(x, rope, train)?;
            heads.push(out);
            aux = commitment;
        }

        let attn_output = Tensor::cat(&heads, D::Minus1)?;
        Ok((self.o_proj.forward(&attn_output)?, aux))
    }
}

/// GELU feed-forward applied to `chunks` slices of the sequence in turn.
pub struct FeedForward {
    up_proj: Linear,
    down_proj: Linear,
    dropout: Dropout,
    chunks: usize,
}

impl FeedForward {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let hidden = config.dim * config.ff_mult;
        Ok(Self {
            up_proj: linear(config.dim, hidden, vb.pp("up_proj"))?,
            down_proj: linear(hidden, config.dim, vb.pp("down_proj"))?,
            dropout: Dropout::new(config.ff_dropout as f32),
            chunks: config.ff_chunks,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if self.chunks <= 1 {
            return self.forward_chunk(x, train);
        }
        let outputs = x
            .chunk(self.chunks, 1)?
            .iter()
            .map(|chunk| self.forward_chunk(chunk, train))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&outputs, 1)
    }

    fn forward_chunk(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.up_proj.forward(&x.contiguous()?)?.gelu_erf()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        self.down_proj.forward(&hidden)
    }
}

pub struct TransformerBlock {
    attention: Attention,
    feed_forward: FeedForward,
    attn_norm: LayerNorm,
    ff_norm: LayerNorm,
}

impl TransformerBlock {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(config, vb.pp("attention"))?,
            feed_forward: FeedForward::new(config, vb.pp("feed_forward"))?,
            attn_norm: LayerNorm::new(config.dim, config.layer_norm_eps, vb.pp("attn_norm"))?,
            ff_norm: LayerNorm::new(config.dim, config.layer_norm_eps, vb.pp("ff_norm"))?,
        })
    }

    fn attend(&self, x: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<(Tensor, Tensor)> {
        let x = self.attn_norm.forward(x)?;
        self.attention.forward(&x, rope, train)
    }

    fn feed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.ff_norm.forward(x)?;
        self.feed_forward.forward(&x, train)
    }

    /// Pre-norm residual block.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (attn, aux) = self.attend(x, rope, train)?;
        let x = (x + attn)?;
        let x = (&x + self.feed(&x, train)?)?;
        Ok((x, aux))
    }

    /// Reversible coupling: `y1 = x1 + attn(x2)`, `y2 = x2 + ff(y1)`.
    pub fn forward_reversible(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        rope: &RotaryEmbedding,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (attn, aux) = self.attend(x2, rope, train)?;
        let y1 = (x1 + attn)?;
        let y2 = (x2 + self.feed(&y1, train)?)?;
        Ok((y1, y2, aux))
    }
}

pub struct RoutingTransformerLM {
    embedding: Embedding,
    layers: Vec<TransformerBlock>,
    norm: LayerNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    config: Config,
    device: Device,
}

impl RoutingTransformerLM {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(config.num_tokens, config.dim, vb.pp("embedding"))?;
        let mut layers = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            layers.push(TransformerBlock::new(config, vb.pp(format!("layers.{}", i)))?);
        }
        let norm = LayerNorm::new(config.dim, config.layer_norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(config.dim, config.num_tokens, vb.pp("lm_head"))?;
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;
        Ok(Self {
            embedding,
            layers,
            norm,
            lm_head,
            rope,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    /// Returns logits `[batch, seq, num_tokens]` and the summed routing loss.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_seq_len {
            candle_core::bail!(
                "sequence length {} exceeds max_seq_len {}",
                seq_len,
                self.config.max_seq_len
            );
        }

        let x = self.embedding.forward(input_ids)?;
        let mut aux = Tensor::zeros((), DType::F32, &self.device)?;

        let x = if self.config.reversible {
            let mut x1 = x.clone();
            let mut x2 = x;
            for layer in &self.layers {
                let (y1, y2, layer_aux) = layer.forward_reversible(&x1, &x2, &self.rope, train)?;
                x1 = y1;
                x2 = y2;
                aux = (aux + layer_aux)?;
            }
            (x1 + x2)?.affine(0.5, 0.0)?
        } else {
            let mut x = x;
            for layer in &self.layers {
                let (y, layer_aux) = layer.forward(&x, &self.rope, train)?;
                x = y;
                aux = (aux + layer_aux)?;
            }
            x
        };

        let x = self.norm.forward(&x)?;
        Ok((self.lm_head.forward(&x)?, aux))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((batch_size * seq_len, vocab_size))?;
    let targets = targets.reshape((batch_size * seq_len,))?;
    candle_nn::loss::cross_entropy(&logits, &targets)
}

/// Mean token cross-entropy over positions where `mask` is non-zero.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let rows = batch_size * seq_len;
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((rows, vocab_size))?, D::Minus1)?;
    let targets = targets.reshape((rows, 1))?.contiguous()?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
    let mask = mask.reshape((rows,))?.to_dtype(DType::F32)?;
    let total = (picked * &mask)?.sum_all()?;
    let count = mask.sum_all()?.maximum(1f32)?;
    total.neg()?.div(&count)
}
