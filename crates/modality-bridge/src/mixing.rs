//! Смешивание нескольких входов одной модальности.

use candle_core::{D, Result, Tensor};

/// Добавка к сумме весов: нулевые веса не дают деления на ноль.
pub const WEIGHT_EPS: f32 = 1e-6;

const NORM_EPS: f64 = 1e-12;

/// L2-нормализация по последней оси. Нулевой вектор остаётся нулевым.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(NORM_EPS)?;
    x.broadcast_div(&norm)
}

/// Взвешенная сумма L2-нормализованных признаков `[B, D]`.
///
/// Веса делятся на `sum + 1e-6`, поэтому один вход с весом 1 почти не
/// меняет масштаб, а все нулевые веса дают нулевой признак.
pub fn mix_weighted(features: &[(Tensor, f32)]) -> Result<Tensor> {
    let Some((first, _)) = features.first() else {
        candle_core::bail!("mix_weighted: no inputs");
    };
    let total: f32 = features.iter().map(|(_, w)| *w).sum();
    let denom = (total + WEIGHT_EPS) as f64;

    let mut acc = first.zeros_like()?;
    for (feature, weight) in features {
        if feature.dims() != first.dims() {
            candle_core::bail!(
                "mix_weighted: shape mismatch {:?} vs {:?}",
                feature.dims(),
                first.dims()
            );
        }
        acc = (acc + (l2_normalize(feature)? * (*weight as f64 / denom))?)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_l2_normalize() {
        let y = l2_normalize(&t(&[3.0, 4.0])).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - 0.6).abs() < 1e-6 && (y[0][1] - 0.8).abs() < 1e-6);
        let z = l2_normalize(&t(&[0.0, 0.0])).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(z[0], vec![0.0, 0.0]);
    }

    #[test]
    fn test_mix_normalises_weights() {
        let mixed = mix_weighted(&[(t(&[2.0, 0.0]), 1.0), (t(&[0.0, 5.0]), 3.0)])
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!((mixed[0][0] - 0.25).abs() < 1e-5);
        assert!((mixed[0][1] - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_zero_weights_do_not_blow_up() {
        let mixed = mix_weighted(&[(t(&[1.0, 1.0]), 0.0)]).unwrap();
        let v = mixed.to_vec2::<f32>().unwrap();
        assert!(v[0].iter().all(|x| x.is_finite() && *x == 0.0));
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(mix_weighted(&[]).is_err());
    }
}
