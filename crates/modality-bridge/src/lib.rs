//! # modality-bridge
//!
//! Путь признака от внешнего энкодера до скрытого пространства LLM:
//!
//! - [`EncoderAdapter`]: окна длинного аудио, усреднение, нулевой фоллбэк
//! - [`ChannelAggregator`]: 1x1 свёртка по каналам энкодера
//! - [`mix_weighted`]: L2-нормализация и взвешенное смешивание входов
//! - [`RetrievalBlend`] + [`FlatIpIndex`]: kNN-сглаживание по прототипам
//! - [`FeatureBridge`] / [`BridgeSet`]: проекция и три gated-MLP блока на модальность

pub mod aggregate;
pub mod bridge;
pub mod encoder;
pub mod layers;
pub mod mixing;
pub mod retrieval;

pub use aggregate::ChannelAggregator;
pub use bridge::{BridgeBlock, BridgeSet, FeatureBridge, BRIDGE_BLOCKS};
pub use encoder::EncoderAdapter;
pub use layers::{BridgeNorm, Dense};
pub use mixing::{l2_normalize, mix_weighted};
pub use retrieval::{FlatIpIndex, RetrievalBlend};
