//! Centralized configuration for StreamDb.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - `Config::from_env()` reads `SDB_*` variables; fluent `with_*` setters
//!   override specific fields for embedded callers.
//!
//! Defaults are read-heavy friendly: page cache on (1024 pages), orphan
//! sweep on open enabled, quick mode off.

use std::fmt;

use crate::consts::PAGE_SIZE;

/// Top-level configuration consumed by `StreamDb::open_with_config` /
/// `create_with_config`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page cache capacity in pages (0 disables the cache).
    /// Env: SDB_PAGE_CACHE_PAGES (default 1024).
    pub page_cache_pages: usize,

    /// Façade path→id cache capacity (0 disables).
    /// Env: SDB_PATH_CACHE_ENTRIES (default 256).
    pub path_cache_entries: usize,

    /// Сколько освобождённых страниц копим в памяти до сброса в free-list.
    /// Env: SDB_HOT_LIST_LIMIT (default 64).
    pub hot_list_limit: usize,

    /// На сколько страниц растим файл за одно расширение; хвост уходит
    /// в free-list. Env: SDB_GROW_BATCH_PAGES (default 16).
    pub grow_batch_pages: u32,

    /// Жёсткий потолок размера файла БД в байтах.
    /// Env: SDB_MAX_DB_BYTES (default 8000 GiB).
    pub max_db_bytes: u64,

    /// Подбирать недостижимые страницы при открытии.
    /// Env: SDB_SWEEP_ON_OPEN (default true; "0|false|off|no" => false).
    pub sweep_on_open: bool,

    /// Начальное значение процессного quick-mode (CRC на чтениях выключен).
    /// Env: SDB_QUICK_MODE (default false).
    pub quick_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_cache_pages: 1024,
            path_cache_entries: 256,
            hot_list_limit: 64,
            grow_batch_pages: 16,
            max_db_bytes: 8000 * 1024 * 1024 * 1024,
            sweep_on_open: true,
            quick_mode: false,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            if default {
                !(s == "0" || s == "false" || s == "off" || s == "no")
            } else {
                s == "1" || s == "true" || s == "on" || s == "yes"
            }
        }
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SDB_PAGE_CACHE_PAGES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.page_cache_pages = n;
            }
        }
        if let Ok(v) = std::env::var("SDB_PATH_CACHE_ENTRIES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.path_cache_entries = n;
            }
        }
        if let Ok(v) = std::env::var("SDB_HOT_LIST_LIMIT") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.hot_list_limit = n;
            }
        }
        if let Ok(v) = std::env::var("SDB_GROW_BATCH_PAGES") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.grow_batch_pages = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("SDB_MAX_DB_BYTES") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.max_db_bytes = n.max(PAGE_SIZE as u64 * 8);
            }
        }
        cfg.sweep_on_open = env_flag("SDB_SWEEP_ON_OPEN", cfg.sweep_on_open);
        cfg.quick_mode = env_flag("SDB_QUICK_MODE", cfg.quick_mode);

        cfg
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_page_cache_pages(mut self, pages: usize) -> Self {
        self.page_cache_pages = pages;
        self
    }

    pub fn with_path_cache_entries(mut self, entries: usize) -> Self {
        self.path_cache_entries = entries;
        self
    }

    pub fn with_hot_list_limit(mut self, limit: usize) -> Self {
        self.hot_list_limit = limit;
        self
    }

    pub fn with_grow_batch_pages(mut self, pages: u32) -> Self {
        self.grow_batch_pages = pages.max(1);
        self
    }

    pub fn with_max_db_bytes(mut self, bytes: u64) -> Self {
        self.max_db_bytes = bytes;
        self
    }

    pub fn with_sweep_on_open(mut self, on: bool) -> Self {
        self.sweep_on_open = on;
        self
    }

    pub fn with_quick_mode(mut self, on: bool) -> Self {
        self.quick_mode = on;
        self
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config {{ page_cache_pages: {}, path_cache_entries: {}, \
             hot_list_limit: {}, grow_batch_pages: {}, max_db_bytes: {}, \
             sweep_on_open: {}, quick_mode: {} }}",
            self.page_cache_pages,
            self.path_cache_entries,
            self.hot_list_limit,
            self.grow_batch_pages,
            self.max_db_bytes,
            self.sweep_on_open,
            self.quick_mode,
        )
    }
}
