//! Хранилище параметров модели с тегами групп.
//!
//! Каждый параметр получает [`ParamGroup`] в момент создания. Стадия обучения
//! выбирает набор групп, и [`ParamStore::apply_trainable`] переводит выбранные
//! параметры в обучаемые `Var` (F32), а остальные в отсоединённые тензоры
//! пониженной точности. Модули держат клоны тензоров, поэтому после смены
//! стадии или загрузки весов их нужно пересобрать поверх хранилища.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Shape, Tensor, Var};
use tracing::debug;

use crate::error::{MmError, MmResult};
use crate::modality::Modality;

/// Группа параметров (назначается при создании).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamGroup {
    /// Агрегатор каналов, проекция и блоки моста модальности.
    Bridge(Modality),
    /// Выходной проектор hidden → conditioning генератора.
    OutputProjector,
    /// Таблица префиксов условных слоёв.
    ConditioningPrefix,
    /// RMSNorm внутри LLM.
    LmNorm,
    /// Bias-добавки к проекциям LLM.
    LmBias,
    /// Low-rank добавки к проекциям LLM.
    LmLowRank,
    /// Гейты инжекции в attention.
    LmGate,
    /// Всё остальное в LLM (проекции, эмбеддинги, выходной слой).
    LmBackbone,
}

impl ParamGroup {
    /// Все группы в фиксированном порядке (для отчётов).
    pub fn all() -> Vec<ParamGroup> {
        let mut out: Vec<ParamGroup> = Modality::all().into_iter().map(ParamGroup::Bridge).collect();
        out.extend([
            ParamGroup::OutputProjector,
            ParamGroup::ConditioningPrefix,
            ParamGroup::LmNorm,
            ParamGroup::LmBias,
            ParamGroup::LmLowRank,
            ParamGroup::LmGate,
            ParamGroup::LmBackbone,
        ]);
        out
    }

    /// Параметр принадлежит языковой модели.
    pub fn is_language_model(self) -> bool {
        matches!(
            self,
            ParamGroup::LmNorm
                | ParamGroup::LmBias
                | ParamGroup::LmLowRank
                | ParamGroup::LmGate
                | ParamGroup::LmBackbone
        )
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamGroup::Bridge(m) => write!(f, "bridge.{m}"),
            ParamGroup::OutputProjector => write!(f, "output_projector"),
            ParamGroup::ConditioningPrefix => write!(f, "prefix_query"),
            ParamGroup::LmNorm => write!(f, "llama.norm"),
            ParamGroup::LmBias => write!(f, "llama.bias"),
            ParamGroup::LmLowRank => write!(f, "llama.lora"),
            ParamGroup::LmGate => write!(f, "llama.gate"),
            ParamGroup::LmBackbone => write!(f, "llama.backbone"),
        }
    }
}

/// Инициализация нового параметра.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamInit {
    Zeros,
    Ones,
    Normal { std: f64 },
    Uniform { bound: f64 },
}

impl ParamInit {
    /// Kaiming-uniform как у `nn.Linear` по умолчанию: `1/sqrt(fan_in)`.
    pub fn linear(fan_in: usize) -> Self {
        ParamInit::Uniform {
            bound: 1.0 / (fan_in.max(1) as f64).sqrt(),
        }
    }

    fn create(self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        let t = match self {
            ParamInit::Zeros => return Tensor::zeros(shape, dtype, device),
            ParamInit::Ones => return Tensor::ones(shape, dtype, device),
            ParamInit::Normal { std } => Tensor::randn(0f32, std as f32, shape, device)?,
            ParamInit::Uniform { bound } => {
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        t.to_dtype(dtype)
    }
}

#[derive(Debug, Clone)]
enum ParamValue {
    Frozen(Tensor),
    Trainable(Var),
}

impl ParamValue {
    fn tensor(&self) -> &Tensor {
        match self {
            ParamValue::Frozen(t) => t,
            ParamValue::Trainable(v) => v.as_tensor(),
        }
    }
}

#[derive(Debug, Clone)]
struct ParamEntry {
    group: ParamGroup,
    value: ParamValue,
}

/// Сводка по группе параметров.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub group: ParamGroup,
    pub tensors: usize,
    pub elements: usize,
    pub trainable_tensors: usize,
}

/// Общее хранилище параметров (аналог `VarMap` с тегами групп).
#[derive(Debug, Clone)]
pub struct ParamStore {
    inner: Arc<Mutex<BTreeMap<String, ParamEntry>>>,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    /// `dtype` это точность замороженных параметров.
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            dtype,
            device: device.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ParamEntry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Корневой построитель параметров для группы.
    pub fn builder(&self, group: ParamGroup) -> ParamBuilder {
        ParamBuilder {
            store: self.clone(),
            path: Vec::new(),
            group,
        }
    }

    /// Вернуть существующий параметр или создать новый.
    ///
    /// Существующий параметр обязан совпадать по форме и группе.
    pub fn get_or_init(
        &self,
        name: &str,
        group: ParamGroup,
        shape: Shape,
        init: ParamInit,
    ) -> candle_core::Result<Tensor> {
        let mut map = self.lock();
        if let Some(entry) = map.get(name) {
            let t = entry.value.tensor();
            if t.shape() != &shape {
                candle_core::bail!(
                    "shape mismatch for {name}: stored {:?}, requested {:?}",
                    t.shape(),
                    shape
                );
            }
            if entry.group != group {
                candle_core::bail!(
                    "group mismatch for {name}: stored {}, requested {}",
                    entry.group,
                    group
                );
            }
            return Ok(t.clone());
        }
        let t = init.create(&shape, self.dtype, &self.device)?;
        map.insert(
            name.to_string(),
            ParamEntry {
                group,
                value: ParamValue::Frozen(t.clone()),
            },
        );
        Ok(t)
    }

    pub fn get(&self, name: &str) -> Option<Tensor> {
        self.lock().get(name).map(|e| e.value.tensor().clone())
    }

    pub fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.lock().get(name).map(|e| e.group)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        matches!(
            self.lock().get(name).map(|e| &e.value),
            Some(ParamValue::Trainable(_))
        )
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Записать новое значение существующего параметра (та же форма).
    ///
    /// Обучаемый параметр обновляется на месте, так что модули, собранные
    /// поверх хранилища, видят новое значение без пересборки.
    pub fn set(&self, name: &str, value: &Tensor) -> MmResult<()> {
        let mut map = self.lock();
        let entry = map
            .get_mut(name)
            .ok_or_else(|| MmError::Checkpoint(format!("unknown parameter {name}")))?;
        let current = entry.value.tensor();
        if current.shape() != value.shape() {
            return Err(MmError::Checkpoint(format!(
                "shape mismatch for {name}: model {:?}, checkpoint {:?}",
                current.shape(),
                value.shape()
            )));
        }
        match &mut entry.value {
            ParamValue::Trainable(var) => {
                var.set(&value.to_device(&self.device)?.to_dtype(DType::F32)?)?;
            }
            ParamValue::Frozen(t) => {
                *t = value.to_device(&self.device)?.to_dtype(self.dtype)?;
            }
        }
        Ok(())
    }

    /// Заменить параметр тензором другой формы (рост словаря).
    pub fn replace_resized(&self, name: &str, value: Tensor) -> MmResult<()> {
        let mut map = self.lock();
        let entry = map
            .get_mut(name)
            .ok_or_else(|| MmError::Model(format!("unknown parameter {name}")))?;
        let value = value.to_device(&self.device)?;
        entry.value = match &entry.value {
            ParamValue::Trainable(_) => {
                ParamValue::Trainable(Var::from_tensor(&value.to_dtype(DType::F32)?)?)
            }
            ParamValue::Frozen(_) => ParamValue::Frozen(value.to_dtype(self.dtype)?),
        };
        Ok(())
    }

    /// Применить выбор обучаемых групп.
    ///
    /// Выбранные параметры становятся F32 `Var` (уже обучаемые переиспользуются),
    /// остальные отсоединяются и приводятся к `dtype` хранилища.
    /// Повторный вызов с тем же выбором ничего не меняет.
    pub fn apply_trainable(&self, selected: impl Fn(ParamGroup) -> bool) -> MmResult<usize> {
        let mut map = self.lock();
        let mut trainable = 0usize;
        for (name, entry) in map.iter_mut() {
            let select = selected(entry.group);
            let next = match (&entry.value, select) {
                (ParamValue::Trainable(_), true) => None,
                (ParamValue::Frozen(t), true) => {
                    let var = Var::from_tensor(&t.to_dtype(DType::F32)?)?;
                    Some(ParamValue::Trainable(var))
                }
                (ParamValue::Trainable(v), false) => Some(ParamValue::Frozen(
                    v.as_tensor().detach().to_dtype(self.dtype)?,
                )),
                (ParamValue::Frozen(t), false) => {
                    if t.dtype() == self.dtype {
                        None
                    } else {
                        Some(ParamValue::Frozen(t.to_dtype(self.dtype)?))
                    }
                }
            };
            if let Some(value) = next {
                debug!("param {name}: trainable={select}");
                entry.value = value;
            }
            if select {
                trainable += 1;
            }
        }
        Ok(trainable)
    }

    /// Обучаемые переменные (для оптимизатора).
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.lock()
            .values()
            .filter_map(|e| match &e.value {
                ParamValue::Trainable(v) => Some(v.clone()),
                ParamValue::Frozen(_) => None,
            })
            .collect()
    }

    /// Имена обучаемых параметров.
    pub fn trainable_names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| matches!(e.value, ParamValue::Trainable(_)))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Снимок параметров, удовлетворяющих фильтру (для сохранения).
    pub fn snapshot(&self, filter: impl Fn(&str, ParamGroup) -> bool) -> HashMap<String, Tensor> {
        self.lock()
            .iter()
            .filter(|(n, e)| filter(n, e.group))
            .map(|(n, e)| (n.clone(), e.value.tensor().clone()))
            .collect()
    }

    /// Сводка по группам: число тензоров, элементов, обучаемых тензоров.
    pub fn summary(&self) -> Vec<GroupSummary> {
        let map = self.lock();
        let mut out: BTreeMap<ParamGroup, GroupSummary> = BTreeMap::new();
        for e in map.values() {
            let s = out.entry(e.group).or_insert(GroupSummary {
                group: e.group,
                tensors: 0,
                elements: 0,
                trainable_tensors: 0,
            });
            s.tensors += 1;
            s.elements += e.value.tensor().elem_count();
            if matches!(e.value, ParamValue::Trainable(_)) {
                s.trainable_tensors += 1;
            }
        }
        out.into_values().collect()
    }
}

/// Построитель параметров с префиксом имени и группой.
#[derive(Debug, Clone)]
pub struct ParamBuilder {
    store: ParamStore,
    path: Vec<String>,
    group: ParamGroup,
}

impl ParamBuilder {
    pub fn pp<S: ToString>(&self, s: S) -> Self {
        let mut path = self.path.clone();
        path.push(s.to_string());
        Self {
            store: self.store.clone(),
            path,
            group: self.group,
        }
    }

    /// Тот же префикс, другая группа.
    pub fn in_group(&self, group: ParamGroup) -> Self {
        Self {
            store: self.store.clone(),
            path: self.path.clone(),
            group,
        }
    }

    pub fn group(&self) -> ParamGroup {
        self.group
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn dtype(&self) -> DType {
        self.store.dtype()
    }

    /// Полное имя параметра.
    pub fn path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path.join("."), name)
        }
    }

    pub fn get<S: Into<Shape>>(
        &self,
        shape: S,
        name: &str,
        init: ParamInit,
    ) -> candle_core::Result<Tensor> {
        self.store
            .get_or_init(&self.path(name), self.group, shape.into(), init)
    }
}
