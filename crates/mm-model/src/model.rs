//! Мультимодальная модель: LLaMA + мосты + послойные условия + проектор.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};
use llama_decoder::{load_consolidated_shards, KvCache, LlamaModel, ShardLoadReport};
use mm_core::model_files::{optional_file, resolve_consolidated_shards, ADAPTER_FILE};
use mm_core::{
    MmError, MmResult, Modality, ParamGroup, ParamStore, RetrievalIndex, TextTokenizer,
    TrainingStage,
};
use modality_bridge::{BridgeSet, RetrievalBlend};
use tracing::{debug, info};

use crate::checkpoint::{load_adapter, AdapterLoadReport};
use crate::conditioning::{ConditioningPrefix, LayerConditioningScheme, ModalityFeatures};
use crate::config::ModelArgs;
use crate::policy::StageTrainabilityPolicy;
use crate::projector::OutputProjector;
use crate::training::{
    capture_window, masked_cross_entropy, token_accuracy, DatasetType, TrainBatch, TrainOutput,
};
use crate::vocab::{GenerationTokens, TokenVocabularyManager};

/// Префикс параметров LLM в хранилище.
pub const LM_PREFIX: &str = "llama";

/// Результат инференс-прохода.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Логиты последней позиции `[B, V]` (F32).
    pub logits: Tensor,
    /// Скрытые состояния последней позиции `[B, 1, D]` (F32), по одному на
    /// голову проектора.
    pub hidden: Vec<Tensor>,
}

/// Модули, собранные поверх хранилища параметров.
#[derive(Debug, Clone)]
struct Modules {
    llama: LlamaModel,
    prefix: ConditioningPrefix,
    bridges: BridgeSet,
    projector: OutputProjector,
}

impl Modules {
    fn build(args: &ModelArgs, store: &ParamStore) -> candle_core::Result<Self> {
        let dim = args.llama.dim;
        Ok(Self {
            llama: LlamaModel::new(&args.llama, &store.builder(ParamGroup::LmBackbone).pp(LM_PREFIX))?,
            prefix: ConditioningPrefix::new(&args.conditioning, dim, store)?,
            bridges: BridgeSet::new(&args.encoders, dim, args.legacy_bridge, store)?,
            projector: OutputProjector::new(&args.projector, dim, args.num_gen_audio_tokens, store)?,
        })
    }
}

pub struct MultimodalModel {
    args: ModelArgs,
    store: ParamStore,
    modules: Modules,
    scheme: LayerConditioningScheme,
    views: Vec<usize>,
    audio_tokens: GenerationTokens,
    retrieval: Option<(RetrievalBlend, Arc<dyn RetrievalIndex>)>,
    stage: Option<TrainingStage>,
}

impl MultimodalModel {
    /// Построить модель со свежими параметрами и расширить словарь токенами `[AUD*]`.
    ///
    /// `vocab_size = 0` в конфиге LLM берётся из токенайзера.
    pub fn new(
        mut args: ModelArgs,
        tokenizer: &mut dyn TextTokenizer,
        dtype: DType,
        device: &Device,
    ) -> MmResult<Self> {
        if args.llama.vocab_size == 0 {
            args.llama.vocab_size = tokenizer.vocab_size();
        }
        args.validate()?;
        let scheme = LayerConditioningScheme::new(args.llama.n_layers, &args.conditioning)?;
        let views = args.projector_views()?;

        let store = ParamStore::new(dtype, device);
        LlamaModel::new(&args.llama, &store.builder(ParamGroup::LmBackbone).pp(LM_PREFIX))?;
        let audio_tokens = TokenVocabularyManager::add_generation_tokens(
            tokenizer,
            &store,
            LM_PREFIX,
            Modality::Audio,
            args.num_gen_audio_tokens,
        )?;
        args.llama.vocab_size = tokenizer.vocab_size();
        let modules = Modules::build(&args, &store)?;

        info!(
            "MultimodalModel: {} слоёв (backbone {:?}), dim={}, словарь {}, {} параметров",
            args.llama.n_layers,
            scheme.backbone_range(),
            args.llama.dim,
            args.llama.vocab_size,
            store.len()
        );
        Ok(Self {
            args,
            store,
            modules,
            scheme,
            views,
            audio_tokens,
            retrieval: None,
            stage: None,
        })
    }

    /// Загрузить модель из директории: `params.json`, шарды LLM,
    /// необязательные `mugen.json` и `adapter.safetensors`.
    pub fn load(
        model_dir: impl AsRef<Path>,
        tokenizer: &mut dyn TextTokenizer,
        dtype: DType,
        device: &Device,
    ) -> MmResult<Self> {
        let model_dir = model_dir.as_ref();
        let args = ModelArgs::from_model_dir(model_dir)?;
        let mut model = Self::new(args, tokenizer, dtype, device)?;
        let shards = resolve_consolidated_shards(model_dir)?;
        model.load_llm_shards(&shards)?;
        if let Some(adapter) = optional_file(model_dir, ADAPTER_FILE) {
            model.load_adapter(adapter)?;
        }
        Ok(model)
    }

    /// Пересобрать модули поверх хранилища (после загрузки весов или смены стадии).
    fn rebuild(&mut self) -> MmResult<()> {
        self.modules = Modules::build(&self.args, &self.store)?;
        debug!("Модули пересобраны поверх {} параметров", self.store.len());
        Ok(())
    }

    pub fn load_llm_shards(&mut self, paths: &[PathBuf]) -> MmResult<ShardLoadReport> {
        let report = load_consolidated_shards(&self.store, LM_PREFIX, paths)?;
        self.rebuild()?;
        Ok(report)
    }

    pub fn load_adapter(&mut self, path: impl AsRef<Path>) -> MmResult<AdapterLoadReport> {
        let report = load_adapter(&self.store, path)?;
        self.rebuild()?;
        Ok(report)
    }

    /// Подключить kNN-индекс прототипов (настройки из `args.retrieval` или по умолчанию).
    pub fn set_retrieval_index(&mut self, index: Arc<dyn RetrievalIndex>) {
        let config = self.args.retrieval.unwrap_or_default();
        info!("kNN-индекс подключён: {} векторов, {:?}", index.len(), config);
        self.retrieval = Some((RetrievalBlend::new(config), index));
    }

    /// Перейти к стадии обучения: выбрать обучаемые группы и пересобрать модули.
    pub fn set_stage(&mut self, stage: TrainingStage) -> MmResult<usize> {
        let n = StageTrainabilityPolicy::new(stage).apply(&self.store)?;
        self.rebuild()?;
        self.stage = Some(stage);
        Ok(n)
    }

    pub fn stage(&self) -> Option<TrainingStage> {
        self.stage
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn scheme(&self) -> &LayerConditioningScheme {
        &self.scheme
    }

    pub fn audio_tokens(&self) -> &GenerationTokens {
        &self.audio_tokens
    }

    pub fn max_seq_len(&self) -> usize {
        self.args.llama.max_seq_len
    }

    pub fn max_batch_size(&self) -> usize {
        self.args.llama.max_batch_size
    }

    pub fn new_cache(&self) -> KvCache {
        self.modules.llama.new_cache()
    }

    // ------------------------------------------------------------------
    // Признаки модальностей
    // ------------------------------------------------------------------

    /// Признак модальности `[B, 1, D]` из выходов энкодера.
    ///
    /// `inputs`: пары (`[B, channels, D_enc]`, вес) для каждого входа модальности.
    pub fn encode_modality(&self, modality: Modality, inputs: &[(Tensor, f32)]) -> MmResult<Tensor> {
        let retrieval = self
            .retrieval
            .as_ref()
            .map(|(blend, index)| (blend, index.as_ref()));
        self.modules.bridges.get(modality).forward(inputs, retrieval)
    }

    // ------------------------------------------------------------------
    // Прямой проход
    // ------------------------------------------------------------------

    /// Все слои с инжекцией. Возвращает выход последнего слоя и выходы
    /// для голов проектора (полные последовательности).
    fn run_layers(
        &self,
        tokens: &Tensor,
        start_pos: usize,
        features: &ModalityFeatures,
        mut cache: Option<&mut KvCache>,
    ) -> MmResult<(Tensor, Vec<Tensor>)> {
        let (_, seq_len) = tokens.dims2()?;
        let llama = &self.modules.llama;
        let mut h = llama.embed(tokens)?;
        let mask = LlamaModel::causal_mask(seq_len, start_pos, h.device(), h.dtype())?;

        let mut views: Vec<Option<Tensor>> = vec![None; self.views.len()];
        let mut record = |depth: usize, h: &Tensor| {
            for (slot, &v) in views.iter_mut().zip(&self.views) {
                if v == depth {
                    *slot = Some(h.clone());
                }
            }
        };
        record(0, &h);
        for layer in 0..self.scheme.num_layers() {
            let injected = self
                .modules
                .prefix
                .for_layer(&self.scheme, layer, features)?;
            let layer_cache = cache.as_deref_mut().and_then(|c| c.layer_mut(layer));
            h = llama.layer(layer, &h, start_pos, mask.as_ref(), injected.as_ref(), layer_cache)?;
            record(layer + 1, &h);
        }
        let views = views
            .into_iter()
            .map(|v| v.ok_or_else(|| MmError::Model("projector view was not recorded".into())))
            .collect::<MmResult<Vec<_>>>()?;
        Ok((h, views))
    }

    /// Инкрементальный проход по `tokens [B, S]` с абсолютной позиции `start_pos`.
    pub fn forward_inference(
        &self,
        tokens: &Tensor,
        start_pos: usize,
        features: &ModalityFeatures,
        cache: &mut KvCache,
    ) -> MmResult<StepOutput> {
        let (batch, seq_len) = tokens.dims2()?;
        self.args.check_batch(batch)?;
        if seq_len == 0 || start_pos + seq_len > self.max_seq_len() {
            return Err(MmError::Inference(format!(
                "positions {start_pos}..{} exceed max_seq_len={}",
                start_pos + seq_len,
                self.max_seq_len()
            )));
        }
        let (h, views) = self.run_layers(tokens, start_pos, features, Some(cache))?;
        let last = |t: &Tensor| t.narrow(1, seq_len - 1, 1);
        let normed = self.modules.llama.norm(&last(&h)?)?;
        let logits = self
            .modules
            .llama
            .output(&normed.squeeze(1)?)?
            .to_dtype(DType::F32)?;
        let hidden = views
            .iter()
            .map(|v| last(v)?.to_dtype(DType::F32))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(StepOutput { logits, hidden })
    }

    /// Conditioning для аудио-генератора из захваченных состояний.
    ///
    /// `views`: по `[B, N, D]` на голову проектора. Эмбеддинги токенов берутся
    /// у литералов `[AUD0]..[AUD{N-1}]`.
    pub fn project_generation(&self, views: &[Tensor]) -> MmResult<Tensor> {
        let first = views
            .first()
            .ok_or_else(|| MmError::Inference("no captured hidden states".into()))?;
        let (batch, _, _) = first.dims3()?;
        let ids = Tensor::new(self.audio_tokens.ids(), self.device())?.unsqueeze(0)?;
        let token_emb = self
            .modules
            .llama
            .embed(&ids)?
            .to_dtype(DType::F32)?
            .repeat((batch, 1, 1))?;
        Ok(self.modules.projector.forward(views, &token_emb)?)
    }

    // ------------------------------------------------------------------
    // Обучение
    // ------------------------------------------------------------------

    /// Обучающий шаг для примера типа `dataset`. Требует выбранной стадии.
    pub fn train_step(&self, dataset: DatasetType, batch: &TrainBatch) -> MmResult<TrainOutput> {
        let stage = self
            .stage
            .ok_or_else(|| MmError::Config("training stage is not set".into()))?;
        dataset.check(stage, &batch.features, batch.caption_embedding.is_some())?;
        let caption = if dataset.produces_audio() {
            batch.caption_embedding.as_ref()
        } else {
            None
        };
        self.forward_train(&batch.tokens, &batch.labels, &batch.features, caption)
    }

    /// Полный проход с лоссами: CE по сдвинутым меткам (0 игнорируется) и,
    /// если дана подпись, MSE проектора в окне `[AUD*]`.
    pub fn forward_train(
        &self,
        tokens: &Tensor,
        labels: &Tensor,
        features: &ModalityFeatures,
        caption_embedding: Option<&Tensor>,
    ) -> MmResult<TrainOutput> {
        let (batch, seq_len) = tokens.dims2()?;
        if labels.dims2()? != (batch, seq_len) || seq_len < 2 {
            return Err(MmError::DataPipeline(format!(
                "tokens {:?} and labels {:?} do not form a batch",
                tokens.dims(),
                labels.dims()
            )));
        }
        let (h, views) = self.run_layers(tokens, 0, features, None)?;
        let llama = &self.modules.llama;
        let logits = llama.output(&llama.norm(&h)?)?;
        let vocab = logits.dim(2)?;

        let shifted_logits = logits.narrow(1, 0, seq_len - 1)?.reshape(((seq_len - 1) * batch, vocab))?;
        let shifted_labels = labels.narrow(1, 1, seq_len - 1)?.contiguous()?;
        let flat_labels = shifted_labels.flatten_all()?;
        let ce = masked_cross_entropy(&shifted_logits, &flat_labels)?;
        let accuracy = token_accuracy(&shifted_logits, &flat_labels)?;

        let mse = match caption_embedding {
            Some(target) => Some(self.projector_loss(&views, &shifted_labels, target)?),
            None => None,
        };
        let loss = match &mse {
            Some(m) => (&ce + (m * self.args.loss_scale)?)?,
            None => ce.clone(),
        };
        if mm_core::debug::enabled() {
            eprintln!(
                "DEBUG train: ce={:.4} mse={:?} acc={accuracy:.3}",
                ce.to_scalar::<f32>()?,
                mse.as_ref().map(|m| m.to_scalar::<f32>()).transpose()?
            );
        }
        Ok(TrainOutput {
            loss,
            ce,
            mse,
            accuracy,
        })
    }

    fn projector_loss(&self, views: &[Tensor], shifted_labels: &Tensor, target: &Tensor) -> MmResult<Tensor> {
        let gen_ids = self.audio_tokens.ids();
        let rows = shifted_labels.to_vec2::<u32>()?;
        let mut hidden_rows: Vec<Vec<Tensor>> = vec![Vec::new(); views.len()];
        let mut emb_rows = Vec::with_capacity(rows.len());
        for (b, row) in rows.iter().enumerate() {
            let window = capture_window(row, gen_ids)?;
            for (acc, view) in hidden_rows.iter_mut().zip(views) {
                acc.push(view.i((b, window.clone()))?);
            }
            let ids = shifted_labels.i((b, window))?.unsqueeze(0)?;
            emb_rows.push(self.modules.llama.embed(&ids)?.squeeze(0)?);
        }
        let views = hidden_rows
            .iter()
            .map(|rows| Tensor::stack(rows, 0)?.to_dtype(DType::F32))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let token_emb = Tensor::stack(&emb_rows, 0)?.to_dtype(DType::F32)?;
        let predicted = self.modules.projector.forward(&views, &token_emb)?;
        if predicted.dims() != target.dims() {
            return Err(MmError::DataPipeline(format!(
                "caption embedding {:?} does not match projector output {:?}",
                target.dims(),
                predicted.dims()
            )));
        }
        let diff = (predicted - target.to_dtype(DType::F32)?)?;
        Ok(diff.sqr()?.mean_all()?)
    }
}

impl std::fmt::Debug for MultimodalModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimodalModel")
            .field("args", &self.args)
            .field("stage", &self.stage)
            .field("params", &self.store.len())
            .finish_non_exhaustive()
    }
}
