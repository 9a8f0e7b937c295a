//! Building blocks of the feature bridge.
//!
//! Bridge parameters can be F32 (trainable) while the incoming features are in
//! another dtype, so every layer casts to its weight dtype and back.

use candle_core::{D, DType, Result, Tensor};
use mm_core::tensor::cast;
use mm_core::{ParamBuilder, ParamInit};

const RMS_EPS: f64 = 1e-6;
const LAYER_NORM_EPS: f64 = 1e-5;

/// Dense projection `y = x W^T (+ b)` over the last axis.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Dense {
    /// Parameters: `{vb}.weight [out, in]`, `{vb}.bias [out]`.
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, vb: &ParamBuilder) -> Result<Self> {
        let weight = vb.get((out_dim, in_dim), "weight", ParamInit::linear(in_dim))?;
        let bias = if bias {
            Some(vb.get(out_dim, "bias", ParamInit::linear(in_dim))?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn in_dim(&self) -> Result<usize> {
        self.weight.dim(1)
    }

    pub fn out_dim(&self) -> Result<usize> {
        self.weight.dim(0)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let w = &self.weight;
        let xw = cast(x, w.dtype())?;
        let y = match xw.rank() {
            2 => xw.matmul(&w.t()?)?,
            _ => xw.broadcast_matmul(&w.t()?)?,
        };
        let y = match &self.bias {
            Some(b) => y.broadcast_add(&cast(b, y.dtype())?)?,
            None => y,
        };
        cast(&y, x_dtype)
    }
}

/// Pre-normalization of a bridge block.
///
/// `Rms` is the current layout; `Layer` (mean/variance with bias) is kept for
/// checkpoints trained with the legacy bridge.
#[derive(Debug, Clone)]
pub enum BridgeNorm {
    Rms { weight: Tensor },
    Layer { weight: Tensor, bias: Tensor },
}

impl BridgeNorm {
    pub fn new(dim: usize, legacy: bool, vb: &ParamBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight", ParamInit::Ones)?;
        if legacy {
            let bias = vb.get(dim, "bias", ParamInit::Zeros)?;
            Ok(Self::Layer { weight, bias })
        } else {
            Ok(Self::Rms { weight })
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        match self {
            Self::Rms { weight } => {
                let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
                let normed = x_f32.broadcast_div(&(variance + RMS_EPS)?.sqrt()?)?;
                normed
                    .to_dtype(input_dtype)?
                    .broadcast_mul(&cast(weight, input_dtype)?)
            }
            Self::Layer { weight, bias } => {
                let mean = x_f32.mean_keepdim(D::Minus1)?;
                let centered = x_f32.broadcast_sub(&mean)?;
                let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
                let normed = centered.broadcast_div(&(variance + LAYER_NORM_EPS)?.sqrt()?)?;
                normed
                    .to_dtype(input_dtype)?
                    .broadcast_mul(&cast(weight, input_dtype)?)?
                    .broadcast_add(&cast(bias, input_dtype)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use mm_core::{Modality, ParamGroup, ParamStore};

    fn builder(store: &ParamStore) -> ParamBuilder {
        store.builder(ParamGroup::Bridge(Modality::Audio)).pp("t")
    }

    #[test]
    fn test_dense_shapes_and_bias() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let vb = builder(&store);
        Dense::new(3, 2, true, &vb.pp("fc")).unwrap();
        store
            .set("t.fc.weight", &Tensor::new(&[[1f32, 0., 0.], [0., 1., 1.]], &Device::Cpu).unwrap())
            .unwrap();
        store
            .set("t.fc.bias", &Tensor::new(&[10f32, 20.], &Device::Cpu).unwrap())
            .unwrap();
        // Модуль это вид над хранилищем: после set его строят заново.
        let dense = Dense::new(3, 2, true, &vb.pp("fc")).unwrap();
        let x = Tensor::new(&[[[1f32, 2., 3.]]], &Device::Cpu).unwrap();
        let y = dense.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2]);
        assert_eq!(y.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![11.0, 25.0]);
    }

    #[test]
    fn test_rms_norm_unit_rms() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let norm = BridgeNorm::new(4, false, &builder(&store).pp("norm")).unwrap();
        let x = Tensor::new(&[[2f32, -2., 2., -2.]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for v in &y[0] {
            assert!((v.abs() - 1.0).abs() < 1e-4);
        }
        assert!(!store.contains("t.norm.bias"));
    }

    #[test]
    fn test_layer_norm_zero_mean() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let norm = BridgeNorm::new(4, true, &builder(&store).pp("norm")).unwrap();
        assert!(store.contains("t.norm.bias"));
        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let mean = y.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 1e-5);
    }
}
