//! Общие константы формата (header БД, страницы, free-list, лимиты).

// -------- Database header (page 0) --------

/// Магия файла БД, байты [0..8] страницы 0.
pub const MAGIC: [u8; 8] = [0x55, 0xAA, 0xFE, 0xED, 0xFA, 0xCE, 0xDA, 0x7A];

/// Размер versioned link на диске: три слота (prior/current/pending),
/// каждый [page_id i32][version i32].
pub const LINK_SIZE: usize = 24;

/// Смещения трёх корневых ссылок внутри страницы 0.
pub const OFF_INDEX_ROOT: usize = 8;
pub const OFF_PATH_ROOT: usize = OFF_INDEX_ROOT + LINK_SIZE;
pub const OFF_FREE_ROOT: usize = OFF_PATH_ROOT + LINK_SIZE;

// -------- Pages --------

/// Единица хранения и I/O.
pub const PAGE_SIZE: usize = 4096;

/// Заголовок страницы:
/// [crc u32][version i32][prev i32][next i32][flags u8][data_len i32][reserved 14B]
pub const PAGE_HDR_SIZE: usize = 35;

/// Полезная нагрузка одной страницы.
pub const PAGE_DATA_CAPACITY: usize = PAGE_SIZE - PAGE_HDR_SIZE; // 4061

/// Отсутствующая страница (пустые prev/next, пустые слоты ссылок).
pub const NO_PAGE: i32 = -1;

/// Страница 0 — заголовок БД; 1..=3 зарезервированы под корневые слоты.
/// Контентные страницы начинаются с 4.
pub const HEADER_PAGE_ID: i32 = 0;
pub const FIRST_CONTENT_PAGE: i32 = 4;

// Смещения полей заголовка страницы.
pub const OFF_CRC: usize = 0;
pub const OFF_VERSION: usize = 4;
pub const OFF_PREV: usize = 8;
pub const OFF_NEXT: usize = 12;
pub const OFF_FLAGS: usize = 16;
pub const OFF_DATA_LEN: usize = 17;

// Тип страницы (flags). Free-list страницы стандартного заголовка не
// несут (см. ниже), поэтому флага для них нет.
pub const FLAG_DATA: u8 = 0b0000_0001;
pub const FLAG_TRIE: u8 = 0b0000_0010;
pub const FLAG_INDEX: u8 = 0b0000_1000;

// -------- Free-list pages --------
//
// Free-list страница использует собственную раскладку (не стандартный
// 35-байтовый заголовок):
//   [crc u32][next i32][used i32][reserved u32][ids i32 x 1020]
// CRC — по байтам [4..4096], как у обычных страниц.

pub const FREE_OFF_NEXT: usize = 4;
pub const FREE_OFF_USED: usize = 8;
pub const FREE_OFF_IDS: usize = 16;

/// Ёмкость одной free-list страницы: (4096 - 16) / 4.
pub const FREE_PAGE_ENTRIES: usize = (PAGE_SIZE - FREE_OFF_IDS) / 4; // 1020

// -------- Limits --------

/// Максимальный сериализованный размер документа.
pub const MAX_DOCUMENT_SIZE: u64 = 256 * 1024 * 1024;

/// Верхняя граница длины цепочки одного документа (+1 страница под пустой
/// документ). Используется как защита от циклов при обходе.
pub const MAX_CHAIN_PAGES: u32 =
    (MAX_DOCUMENT_SIZE / PAGE_DATA_CAPACITY as u64) as u32 + 2;
