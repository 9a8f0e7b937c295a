//! Выбор обучаемых групп параметров по стадии.

use mm_core::{MmResult, ParamGroup, ParamStore, TrainingStage};
use tracing::info;

/// Отображение стадия -> набор обучаемых групп.
///
/// Гейты инжекции (`LmGate`) не открывает ни одна стадия: они приходят
/// из adapter-чекпоинта.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTrainabilityPolicy {
    stage: TrainingStage,
}

impl StageTrainabilityPolicy {
    pub fn new(stage: TrainingStage) -> Self {
        Self { stage }
    }

    pub fn stage(&self) -> TrainingStage {
        self.stage
    }

    pub fn selects(&self, group: ParamGroup) -> bool {
        let bridges = matches!(group, ParamGroup::Bridge(_));
        let decoder_side = matches!(
            group,
            ParamGroup::OutputProjector | ParamGroup::ConditioningPrefix
        );
        match self.stage {
            TrainingStage::EncoderAlignment => bridges,
            TrainingStage::DecoderAlignment => decoder_side,
            TrainingStage::InstructionTuning => {
                bridges
                    || decoder_side
                    || matches!(
                        group,
                        ParamGroup::LmNorm | ParamGroup::LmBias | ParamGroup::LmLowRank
                    )
            }
        }
    }

    /// Обучаемые группы в порядке [`ParamGroup::all`].
    pub fn groups(&self) -> Vec<ParamGroup> {
        ParamGroup::all()
            .into_iter()
            .filter(|g| self.selects(*g))
            .collect()
    }

    /// Применить к хранилищу: выбранное в F32 `Var`, остальное заморожено.
    ///
    /// Модули, собранные поверх хранилища, после этого нужно пересобрать.
    pub fn apply(&self, store: &ParamStore) -> MmResult<usize> {
        let n = store.apply_trainable(|g| self.selects(g))?;
        info!(
            "Стадия {} ({:?}): {n} обучаемых тензоров из {}",
            self.stage.number(),
            self.stage,
            store.len()
        );
        Ok(n)
    }
}
