//! Токенайзер LLaMA поверх `tokenizers` (HF `tokenizer.json`).
//!
//! BOS добавляется вручную: post-processor LLaMA-токенайзеров сам вставляет
//! `<s>`, поэтому кодирование идёт с `add_special_tokens = false`.

use std::path::Path;

use mm_core::{MmError, MmResult, TextTokenizer};
use tokenizers::{AddedToken, Tokenizer};

const BOS_TOKEN: &str = "<s>";
const EOS_TOKEN: &str = "</s>";

pub struct HfTokenizer {
    inner: Tokenizer,
    bos_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    /// Загрузить `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> MmResult<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            MmError::Model(format!("Не удалось загрузить токенайзер {}: {e}", path.display()))
        })?;
        Self::from_tokenizer(inner)
    }

    /// Токенайзер из содержимого `tokenizer.json`.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> MmResult<Self> {
        let inner = Tokenizer::from_bytes(bytes)
            .map_err(|e| MmError::Model(format!("Некорректный tokenizer.json: {e}")))?;
        Self::from_tokenizer(inner)
    }

    fn from_tokenizer(inner: Tokenizer) -> MmResult<Self> {
        let id = |token: &str| {
            inner.token_to_id(token).ok_or_else(|| {
                MmError::Config(format!("В словаре токенайзера нет {token}"))
            })
        };
        let bos_id = id(BOS_TOKEN)?;
        let eos_id = id(EOS_TOKEN)?;
        Ok(Self {
            inner,
            bos_id,
            eos_id,
        })
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> MmResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| MmError::Prompt(format!("Ошибка токенизации: {e}")))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if add_bos {
            ids.push(self.bos_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> MmResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| MmError::Inference(format!("Ошибка декодирования токенов: {e}")))
    }

    fn add_token(&mut self, literal: &str) -> MmResult<usize> {
        Ok(self.inner.add_tokens(&[AddedToken::from(literal, false)]))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn bos_token_id(&self) -> u32 {
        self.bos_id
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .finish()
    }
}
