//! Free-page allocator.
//!
//! Три источника страниц, в порядке предпочтения:
//!   1) hot-list — LIFO в памяти, последние освобождённые;
//!   2) дисковая цепочка free-list страниц (pop с хвоста);
//!   3) расширение файла пачкой grow_batch_pages (хвост пачки уходит
//!      в hot-list).
//!
//! Дисковая free-list страница (raw-раскладка, см. consts):
//!   [crc u32][next i32][used i32][reserved u32][ids i32 x 1020]
//! Пуши и попы идут на хвостовой странице цепочки. Переполненный хвост
//! наращивается: освобождаемая страница сама становится новым хвостом
//! (контейнер не считается free-записью). Опустошённая попами страница
//! сама уходит в реюз, а next предыдущей страницы переписывается.
//!
//! Карантин: цепочка перезаписанного документа ставится в очередь с
//! release_at = rotation + 1 и попадает в free-list только на следующей
//! ротации indirection-корня — вместе со слотами versioned link это даёт
//! политику удержания трёх версий.

use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use crate::consts::{
    FIRST_CONTENT_PAGE, FREE_OFF_IDS, FREE_OFF_NEXT, FREE_OFF_USED,
    FREE_PAGE_ENTRIES, NO_PAGE, PAGE_SIZE,
};
use crate::error::{Result, StreamDbError};
use crate::metrics::{
    record_freelist_rebuild, record_page_freed, record_page_fresh, record_page_reused,
};
use crate::page::{crc_update, crc_verify};
use crate::store::PageStore;

// ---------- Free-list page codec ----------

fn fl_next(buf: &[u8; PAGE_SIZE]) -> i32 {
    LittleEndian::read_i32(&buf[FREE_OFF_NEXT..FREE_OFF_NEXT + 4])
}

fn fl_set_next(buf: &mut [u8; PAGE_SIZE], next: i32) {
    LittleEndian::write_i32(&mut buf[FREE_OFF_NEXT..FREE_OFF_NEXT + 4], next);
}

fn fl_used(buf: &[u8; PAGE_SIZE]) -> i32 {
    LittleEndian::read_i32(&buf[FREE_OFF_USED..FREE_OFF_USED + 4])
}

fn fl_set_used(buf: &mut [u8; PAGE_SIZE], used: i32) {
    LittleEndian::write_i32(&mut buf[FREE_OFF_USED..FREE_OFF_USED + 4], used);
}

fn fl_entry(buf: &[u8; PAGE_SIZE], i: usize) -> i32 {
    let off = FREE_OFF_IDS + i * 4;
    LittleEndian::read_i32(&buf[off..off + 4])
}

fn fl_set_entry(buf: &mut [u8; PAGE_SIZE], i: usize, pid: i32) {
    let off = FREE_OFF_IDS + i * 4;
    LittleEndian::write_i32(&mut buf[off..off + 4], pid);
}

fn fl_init(next: i32) -> [u8; PAGE_SIZE] {
    let mut buf = [0u8; PAGE_SIZE];
    fl_set_next(&mut buf, next);
    fl_set_used(&mut buf, 0);
    crc_update(&mut buf);
    buf
}

// Free-list страницы проверяются всегда, независимо от quick mode:
// на их целостности держится аллокатор, а восстановление по скану
// возможно только если порча обнаружена.
fn fl_read(store: &PageStore, pid: i32) -> Result<[u8; PAGE_SIZE]> {
    let buf = store.read_raw(pid)?;
    if !crc_verify(&buf) {
        return Err(StreamDbError::CorruptPage(pid));
    }
    Ok(buf)
}

fn fl_write(store: &PageStore, pid: i32, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
    crc_update(buf);
    store.write_raw(pid, buf)
}

// ---------- Allocator ----------

struct QuarantineEntry {
    release_at: u64,
    pages: Vec<i32>,
}

pub struct Allocator {
    root: i32,
    tail: i32,
    disk_count: u64,
    hot: Vec<i32>,
    hot_limit: usize,
    quarantine: Vec<QuarantineEntry>,
    /// Счётчик ротаций indirection-корня (время жизни процесса).
    rotation: u64,
    grow_batch: u32,
    max_db_bytes: u64,
    root_dirty: bool,
}

impl Allocator {
    pub fn new(hot_limit: usize, grow_batch: u32, max_db_bytes: u64) -> Self {
        Self {
            root: NO_PAGE,
            tail: NO_PAGE,
            disk_count: 0,
            hot: Vec::new(),
            hot_limit: hot_limit.max(1),
            quarantine: Vec::new(),
            rotation: 0,
            grow_batch: grow_batch.max(1),
            max_db_bytes,
            root_dirty: false,
        }
    }

    /// Подцепить дисковую цепочку, пересчитав записи и найдя хвост.
    /// `CorruptPage` отсюда означает "нужна пересборка сканом".
    pub fn attach(&mut self, store: &PageStore, root: i32) -> Result<()> {
        self.root = root;
        self.tail = root;
        self.disk_count = 0;
        if root == NO_PAGE {
            return Ok(());
        }
        let total = store.len_pages()? as u64;
        let mut seen = 0u64;
        let mut pid = root;
        loop {
            let buf = fl_read(store, pid)?;
            let used = fl_used(&buf);
            if used < 0 || used as usize > FREE_PAGE_ENTRIES {
                return Err(StreamDbError::CorruptPage(pid));
            }
            self.disk_count += used as u64;
            self.tail = pid;
            let next = fl_next(&buf);
            if next == NO_PAGE {
                break;
            }
            seen += 1;
            if seen > total {
                // Цикл в цепочке — считаем повреждением.
                return Err(StreamDbError::CorruptPage(pid));
            }
            pid = next;
        }
        Ok(())
    }

    pub fn root(&self) -> i32 {
        self.root
    }

    /// Корень цепочки поменялся с последнего опроса — façade должен
    /// переписать free-root link в header.
    pub fn take_root_change(&mut self) -> Option<i32> {
        if self.root_dirty {
            self.root_dirty = false;
            Some(self.root)
        } else {
            None
        }
    }

    pub fn rotation(&self) -> u64 {
        self.rotation
    }

    /// Свободные страницы: дисковые записи + hot-list.
    /// Карантин свободным не считается.
    pub fn count(&self) -> u64 {
        self.disk_count + self.hot.len() as u64
    }

    // ----- allocate / free -----

    pub fn allocate(&mut self, store: &PageStore) -> Result<i32> {
        if let Some(pid) = self.hot.pop() {
            record_page_reused();
            return Ok(pid);
        }
        if self.root != NO_PAGE {
            if let Some(pid) = self.pop_disk(store)? {
                record_page_reused();
                return Ok(pid);
            }
        }
        self.extend(store)
    }

    pub fn free(&mut self, store: &PageStore, pid: i32) -> Result<()> {
        if pid < FIRST_CONTENT_PAGE || pid >= store.len_pages()? {
            return Err(StreamDbError::OutOfRange(pid));
        }
        self.hot.push(pid);
        record_page_freed();
        if self.hot.len() > self.hot_limit {
            self.drain_hot(store)?;
        }
        Ok(())
    }

    pub fn free_many(&mut self, store: &PageStore, pages: &[i32]) -> Result<()> {
        for &pid in pages {
            self.free(store, pid)?;
        }
        Ok(())
    }

    /// Сбросить hot-list в дисковую цепочку (flush/shutdown).
    pub fn drain_hot(&mut self, store: &PageStore) -> Result<()> {
        while let Some(pid) = self.hot.pop() {
            self.push_disk(store, pid)?;
        }
        Ok(())
    }

    // ----- retention -----

    /// Поставить цепочку перезаписанного документа в карантин до
    /// следующей ротации indirection-корня.
    pub fn quarantine(&mut self, pages: Vec<i32>) {
        if pages.is_empty() {
            return;
        }
        self.quarantine.push(QuarantineEntry {
            release_at: self.rotation + 1,
            pages,
        });
    }

    /// Зафиксировать успешную ротацию indirection-корня и выпустить
    /// дозревшие карантинные цепочки в free-list.
    pub fn on_rotation(&mut self, store: &PageStore) -> Result<()> {
        self.rotation += 1;
        let due: Vec<QuarantineEntry> = {
            let rotation = self.rotation;
            let (due, keep): (Vec<_>, Vec<_>) = self
                .quarantine
                .drain(..)
                .partition(|e| e.release_at <= rotation);
            self.quarantine = keep;
            due
        };
        for entry in due {
            self.free_many(store, &entry.pages)?;
        }
        Ok(())
    }

    // ----- internals -----

    fn pop_disk(&mut self, store: &PageStore) -> Result<Option<i32>> {
        if self.tail == NO_PAGE {
            return Ok(None);
        }
        let mut buf = fl_read(store, self.tail)?;
        let used = fl_used(&buf);
        if used < 0 || used as usize > FREE_PAGE_ENTRIES {
            return Err(StreamDbError::CorruptPage(self.tail));
        }

        if used > 0 {
            let pid = fl_entry(&buf, used as usize - 1);
            fl_set_used(&mut buf, used - 1);
            fl_write(store, self.tail, &mut buf)?;
            self.disk_count -= 1;
            return Ok(Some(pid));
        }

        // Хвост пуст: страница-контейнер сама становится аллокацией,
        // next предыдущей страницы переписывается.
        let emptied = self.tail;
        if self.tail == self.root {
            self.root = NO_PAGE;
            self.tail = NO_PAGE;
            self.root_dirty = true;
        } else {
            let prev = self.find_prev(store, emptied)?;
            let mut pbuf = fl_read(store, prev)?;
            fl_set_next(&mut pbuf, NO_PAGE);
            fl_write(store, prev, &mut pbuf)?;
            self.tail = prev;
        }
        Ok(Some(emptied))
    }

    fn push_disk(&mut self, store: &PageStore, pid: i32) -> Result<()> {
        if self.root == NO_PAGE {
            // Освобождаемая страница становится первым контейнером.
            let mut buf = fl_init(NO_PAGE);
            fl_write(store, pid, &mut buf)?;
            self.root = pid;
            self.tail = pid;
            self.root_dirty = true;
            return Ok(());
        }

        let mut buf = fl_read(store, self.tail)?;
        let used = fl_used(&buf);
        if used < 0 || used as usize > FREE_PAGE_ENTRIES {
            return Err(StreamDbError::CorruptPage(self.tail));
        }
        if (used as usize) < FREE_PAGE_ENTRIES {
            fl_set_entry(&mut buf, used as usize, pid);
            fl_set_used(&mut buf, used + 1);
            fl_write(store, self.tail, &mut buf)?;
            self.disk_count += 1;
            return Ok(());
        }

        // Хвост полон: pid становится новым пустым контейнером.
        let mut nbuf = fl_init(NO_PAGE);
        fl_write(store, pid, &mut nbuf)?;
        fl_set_next(&mut buf, pid);
        fl_write(store, self.tail, &mut buf)?;
        self.tail = pid;
        Ok(())
    }

    fn find_prev(&self, store: &PageStore, target: i32) -> Result<i32> {
        let mut pid = self.root;
        let total = store.len_pages()? as u64;
        let mut hops = 0u64;
        while pid != NO_PAGE {
            let buf = fl_read(store, pid)?;
            let next = fl_next(&buf);
            if next == target {
                return Ok(pid);
            }
            pid = next;
            hops += 1;
            if hops > total {
                break;
            }
        }
        Err(StreamDbError::CorruptPage(target))
    }

    fn extend(&mut self, store: &PageStore) -> Result<i32> {
        let cur = store.len_pages()?;
        let allowed = (self.max_db_bytes / PAGE_SIZE as u64).min(i32::MAX as u64) as i32;
        if cur >= allowed {
            return Err(StreamDbError::OutOfSpace);
        }
        let batch = (self.grow_batch as i32).min(allowed - cur).max(1);
        store.grow_to_pages(cur + batch)?;

        for _ in 0..batch {
            record_page_fresh();
        }
        // Первую страницу отдаём, хвост пачки — в hot-list.
        for pid in (cur + 1)..(cur + batch) {
            self.hot.push(pid);
        }
        Ok(cur)
    }

    // ----- scan rebuild -----

    /// Пересобрать free-list с нуля: свободно всё, что не достижимо из
    /// корней и не стоит в карантине. Вызывается, когда дисковая цепочка
    /// не прошла CRC.
    pub fn rebuild(
        &mut self,
        store: &PageStore,
        reachable: &HashSet<i32>,
        total_pages: i32,
    ) -> Result<()> {
        warn!(
            "rebuilding free list by scan over {} pages ({} reachable)",
            total_pages,
            reachable.len()
        );
        let quarantined: HashSet<i32> = self
            .quarantine
            .iter()
            .flat_map(|e| e.pages.iter().copied())
            .collect();

        self.root = NO_PAGE;
        self.tail = NO_PAGE;
        self.disk_count = 0;
        self.hot.clear();
        self.root_dirty = true;

        let mut recovered = 0u64;
        for pid in FIRST_CONTENT_PAGE..total_pages {
            if reachable.contains(&pid) || quarantined.contains(&pid) {
                continue;
            }
            self.push_disk(store, pid)?;
            recovered += 1;
        }
        record_freelist_rebuild();
        info!("free list rebuilt: {} pages free", recovered);
        Ok(())
    }
}
