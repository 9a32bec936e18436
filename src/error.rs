//! Error taxonomy of the engine.
//!
//! Recovery decisions hang off these variants (prior-slot fallback on
//! `CorruptPage`, scan rebuild of the free list, silent deletes), so the
//! library surface is a typed enum rather than opaque error chains.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StreamDbError>;

#[derive(Debug, Error)]
pub enum StreamDbError {
    /// Страница 0 не начинается с магии StreamDb. Fatal при открытии.
    #[error("bad database magic")]
    BadMagic,

    /// CRC страницы не сошёлся при верифицированном чтении.
    #[error("page {0}: CRC mismatch")]
    CorruptPage(i32),

    /// Носитель вернул меньше байт, чем запрошено.
    #[error("page {0}: short read from medium")]
    ShortRead(i32),

    /// page_id отрицательный или за пределами файла.
    #[error("page id {0} out of range")]
    OutOfRange(i32),

    /// Несогласованность prev/next/version при обходе цепочки.
    #[error("corrupt chain at page {page}: {reason}")]
    CorruptChain { page: i32, reason: String },

    /// Versioned link не сошёлся; восстанавливается откатом на prior-слот.
    #[error("torn rotation in versioned link: {0}")]
    TornRotation(&'static str),

    /// Носитель отказался расти (или упёрлись в max_db_bytes).
    #[error("backing medium refused to grow")]
    OutOfSpace,

    /// Документ больше 256 MiB.
    #[error("document of {0} bytes exceeds the 256 MiB limit")]
    TooLarge(u64),

    #[error("unknown document id {0}")]
    UnknownId(Uuid),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamDbError {
    /// Повреждение данных, при котором чтение документа имеет смысл
    /// повторить через prior-слот indirection-таблицы.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StreamDbError::CorruptPage(_)
                | StreamDbError::ShortRead(_)
                | StreamDbError::CorruptChain { .. }
                | StreamDbError::TornRotation(_)
        )
    }
}
