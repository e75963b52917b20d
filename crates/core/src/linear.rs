//! Linear projection with f32 master weights.
//!
//! The weight is cast to the dtype of the incoming activations on every call,
//! so a reduced-precision forward never touches the stored parameters and the
//! cast is differentiated back into f32 gradients.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// `y = x Wᵀ + b`, weight stored as `(out, in)`.
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Weight drawn from `N(0, std²)`, bias zero-initialised.
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, std: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: std,
            },
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn num_params(&self) -> usize {
        self.weight.elem_count() + self.bias.as_ref().map(|b| b.elem_count()).unwrap_or(0)
    }

    /// Project the last dimension of `x`; leading dimensions are preserved.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let w = self.weight.to_dtype(dtype)?;
        let (out_dim, in_dim) = w.dims2()?;

        let mut dims = x.dims().to_vec();
        let rows = x.elem_count() / in_dim;
        let y = x.reshape((rows, in_dim))?.matmul(&w.t()?)?;
        let y = match &self.bias {
            Some(b) => y.broadcast_add(&b.to_dtype(dtype)?)?,
            None => y,
        };
        if let Some(last) = dims.last_mut() {
            *last = out_dim;
        }
        y.reshape(dims)
    }
}
