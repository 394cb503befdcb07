use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// One GRU layer. Gates are stacked `[reset, update, new]` and weights are
/// named `weight_ih_l{k}`, `weight_hh_l{k}`, `bias_ih_l{k}`, `bias_hh_l{k}`
/// so a multi-layer stack shares one namespace.
pub struct GruLayer {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden_dim: usize,
}

impl GruLayer {
    pub fn new(vb: &VarBuilder, layer: usize, input_dim: usize, hidden_dim: usize) -> Result<Self> {
        let bound = 1.0 / (hidden_dim as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 3 * hidden_dim;
        Ok(Self {
            w_ih: vb.get_with_hints((gates, input_dim), &format!("weight_ih_l{layer}"), init)?,
            w_hh: vb.get_with_hints((gates, hidden_dim), &format!("weight_hh_l{layer}"), init)?,
            b_ih: vb.get_with_hints(gates, &format!("bias_ih_l{layer}"), init)?,
            b_hh: vb.get_with_hints(gates, &format!("bias_hh_l{layer}"), init)?,
            hidden_dim,
        })
    }

    pub fn zero_state(&self, batch: usize, reference: &Tensor) -> Result<Tensor> {
        Tensor::zeros((batch, self.hidden_dim), reference.dtype(), reference.device())
    }

    /// `x`: `[batch, input_dim]`, `h`: `[batch, hidden_dim]`. Returns the next hidden state.
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gi = x.matmul(&self.w_ih.t()?)?.broadcast_add(&self.b_ih)?;
        let gh = h.matmul(&self.w_hh.t()?)?.broadcast_add(&self.b_hh)?;
        let gi = gi.chunk(3, 1)?;
        let gh = gh.chunk(3, 1)?;

        let reset = sigmoid(&(&gi[0] + &gh[0])?)?;
        let update = sigmoid(&(&gi[1] + &gh[1])?)?;
        let candidate = (&gi[2] + (&reset * &gh[2])?)?.tanh()?;

        // h' = (1 - z) * n + z * h
        let keep = (&update * h)?;
        let blend = (update.affine(-1.0, 1.0)? * candidate)?;
        keep + blend
    }
}
