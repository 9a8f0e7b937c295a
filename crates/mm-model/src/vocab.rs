//! Зарезервированные токены генерации (`[AUD0]` ... `[AUD{N-1}]`).

use llama_decoder::grow_vocabulary;
use mm_core::{MmError, MmResult, Modality, ParamStore, TextTokenizer};
use tracing::{debug, info};

/// Id зарезервированных токенов одной модальности, в порядке `0..N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTokens {
    modality: Modality,
    ids: Vec<u32>,
}

impl GenerationTokens {
    pub fn new(modality: Modality, ids: Vec<u32>) -> Self {
        Self { modality, ids }
    }

    /// Литерал `i`-го токена: `[AUD3]`.
    pub fn literal(modality: Modality, i: usize) -> String {
        format!("[{}{i}]", modality.gen_token_prefix())
    }

    /// Все литералы подряд: `[AUD0][AUD1]...`.
    pub fn joined_literals(&self) -> String {
        (0..self.ids.len())
            .map(|i| Self::literal(self.modality, i))
            .collect()
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Первый токен группы: с него начинается захват скрытых состояний.
    pub fn first(&self) -> Option<u32> {
        self.ids.first().copied()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }
}

/// Расширение словаря токенайзера и матриц LLM.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenVocabularyManager;

impl TokenVocabularyManager {
    /// Добавить `count` токенов модальности и дорастить эмбеддинги и
    /// выходной слой LLM (параметры `{lm_prefix}.*`) до нового размера словаря.
    ///
    /// Литерал, который токенайзер уже знает как один токен, означает
    /// коллизию имён и приводит к ошибке.
    pub fn add_generation_tokens(
        tokenizer: &mut dyn TextTokenizer,
        store: &ParamStore,
        lm_prefix: &str,
        modality: Modality,
        count: usize,
    ) -> MmResult<GenerationTokens> {
        let vocab_before = tokenizer.vocab_size();
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let literal = GenerationTokens::literal(modality, i);
            let added = tokenizer.add_token(&literal)?;
            let encoded = tokenizer.encode(&literal, false)?;
            if added != 1 {
                return Err(MmError::Vocabulary(format!(
                    "{literal} is already in the vocabulary (ids {encoded:?})"
                )));
            }
            let &[id] = encoded.as_slice() else {
                return Err(MmError::Vocabulary(format!(
                    "{literal} tokenizes to {} ids: {encoded:?}",
                    encoded.len()
                )));
            };
            if ids.contains(&id) || (id as usize) < vocab_before {
                return Err(MmError::Vocabulary(format!(
                    "{literal} got id {id} that is not new"
                )));
            }
            debug!("{literal} -> {id}");
            ids.push(id);
        }

        let vocab = tokenizer.vocab_size();
        let rows = store
            .get(&format!("{lm_prefix}.tok_embeddings.weight"))
            .ok_or_else(|| MmError::Model(format!("missing {lm_prefix}.tok_embeddings.weight")))?
            .dim(0)?;
        if vocab < rows {
            return Err(MmError::Vocabulary(format!(
                "tokenizer has {vocab} tokens, model already has {rows} rows"
            )));
        }
        grow_vocabulary(store, lm_prefix, vocab - rows)?;
        info!(
            "Добавлено {count} токенов {}: {:?} (словарь {vocab_before} -> {vocab})",
            modality, ids
        );
        Ok(GenerationTokens::new(modality, ids))
    }
}
