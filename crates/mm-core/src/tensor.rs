//! Мелкие тензорные утилиты, общие для слоёв декодера и мостов.

use candle_core::{DType, Result, Tensor};

/// Привести `x` к `dtype`; без копии, если тип уже совпадает.
///
/// Замороженные веса и обучаемые добавки живут в разных dtype, поэтому
/// слои приводят входы к типу веса и обратно.
pub fn cast(x: &Tensor, dtype: DType) -> Result<Tensor> {
    if x.dtype() == dtype {
        Ok(x.clone())
    } else {
        x.to_dtype(dtype)
    }
}
