use candle_core::{Module, Result, Tensor, D};
use candle_nn::{self as nn, Dropout, VarBuilder};

use super::layer_norm::LayerNorm;

/// Multi-head self-attention with a fused `in_proj` (q, k and v stacked along the output dim).
struct SelfAttention {
    in_proj: nn::Linear,
    out_proj: nn::Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl SelfAttention {
    fn new(vb: VarBuilder, model_dim: usize, num_heads: usize, dropout: f32) -> Result<Self> {
        if num_heads == 0 || model_dim % num_heads != 0 {
            candle_core::bail!("model dim {model_dim} is not divisible by {num_heads} heads")
        }
        Ok(Self {
            in_proj: nn::linear(model_dim, 3 * model_dim, vb.pp("in_proj"))?,
            out_proj: nn::linear(model_dim, model_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: model_dim / num_heads,
            dropout: Dropout::new(dropout),
        })
    }

    /// `x`: `[batch, seq, model_dim]`. Positions only attend within their own sample.
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, model_dim) = x.dims3()?;
        let qkv = self.in_proj.forward(x)?;
        let heads = |t: &Tensor| -> Result<Tensor> {
            t.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(&qkv.narrow(D::Minus1, 0, model_dim)?)?;
        let k = heads(&qkv.narrow(D::Minus1, model_dim, model_dim)?)?;
        let v = heads(&qkv.narrow(D::Minus1, 2 * model_dim, model_dim)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let weights = nn::ops::softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward(&weights, train)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, model_dim))?;
        self.out_proj.forward(&out)
    }
}

/// Post-norm transformer encoder layer with a ReLU feed-forward block.
pub struct EncoderLayer {
    self_attn: SelfAttention,
    linear1: nn::Linear,
    linear2: nn::Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(
        vb: VarBuilder,
        model_dim: usize,
        num_heads: usize,
        ff_dim: usize,
        dropout: f32,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: SelfAttention::new(vb.pp("self_attn"), model_dim, num_heads, dropout)?,
            linear1: nn::linear(model_dim, ff_dim, vb.pp("linear1"))?,
            linear2: nn::linear(ff_dim, model_dim, vb.pp("linear2"))?,
            norm1: LayerNorm::new(vb.pp("norm1"), model_dim, 1e-5)?,
            norm2: LayerNorm::new(vb.pp("norm2"), model_dim, 1e-5)?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // Attention sub-block: residual, then norm
        let attn = self.self_attn.forward(x, train)?;
        let x = self.norm1.forward(&(x + self.dropout.forward(&attn, train)?)?)?;

        // Feed-forward sub-block
        let ff = self.linear1.forward(&x)?.relu()?;
        let ff = self.linear2.forward(&self.dropout.forward(&ff, train)?)?;
        self.norm2.forward(&(&x + self.dropout.forward(&ff, train)?)?)
    }
}
