//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `RUSTMUGEN_DEBUG` (любое непустое значение).
/// Используется для дорогой статистики по тензорам, которую не стоит считать всегда.
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os("RUSTMUGEN_DEBUG").is_some_and(|v| !v.is_empty())
    })
}
