//! Цепочки страниц: запись байтового потока в связанные страницы и
//! ленивое чтение обратно.
//!
//! Порядок вставки равен порядку байт. Голова цепочки хранится в
//! indirection-таблице; середина достижима только по next-указателям.
//! Все страницы цепочки штампуются версией документа; убывание версии
//! по ходу обхода означает порванную ротацию.

use std::io::{self, Read};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::consts::{MAX_CHAIN_PAGES, MAX_DOCUMENT_SIZE, NO_PAGE, PAGE_DATA_CAPACITY};
use crate::error::{Result, StreamDbError};
use crate::freelist::Allocator;
use crate::page::Page;
use crate::store::PageStore;

/// Результат записи цепочки.
pub struct WrittenChain {
    pub head: i32,
    pub pages: Vec<i32>,
    pub total_len: u64,
}

/// Дочитать буфер до упора: Read может отдавать данные кусками.
fn fill_chunk(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Записать поток в свежую цепочку страниц. Страницы аллоцируются по
/// одной и здесь не флашатся — флаш и ротация корня за вызывающим.
/// При ошибке все уже аллоцированные страницы возвращаются в free-list.
pub fn write_chain(
    store: &PageStore,
    alloc: &Mutex<Allocator>,
    source: &mut dyn Read,
    version: i32,
    flags: u8,
) -> Result<WrittenChain> {
    let mut pages: Vec<i32> = Vec::new();
    let result = write_chain_inner(store, alloc, source, version, flags, &mut pages);
    if result.is_err() {
        // Недописанная цепочка никуда не подключена — сразу в free-list.
        let mut a = alloc.lock();
        if let Err(e) = a.free_many(store, &pages) {
            debug!("failed to reclaim aborted chain: {}", e);
        }
    }
    result
}

fn write_chain_inner(
    store: &PageStore,
    alloc: &Mutex<Allocator>,
    source: &mut dyn Read,
    version: i32,
    flags: u8,
    pages: &mut Vec<i32>,
) -> Result<WrittenChain> {
    let mut chunk = vec![0u8; PAGE_DATA_CAPACITY];
    let mut total: u64 = 0;
    let mut prev: i32 = NO_PAGE;

    loop {
        let n = fill_chunk(source, &mut chunk)?;
        if n == 0 && !pages.is_empty() {
            break;
        }
        total += n as u64;
        if total > MAX_DOCUMENT_SIZE {
            return Err(StreamDbError::TooLarge(total));
        }

        let pid = alloc.lock().allocate(store)?;
        let mut page = Page::new(pid, flags, version);
        page.header.prev = prev;
        page.set_data(&chunk[..n]);
        store.write(&page)?;

        if prev != NO_PAGE {
            let mut pbuf = store.read(prev, true)?;
            pbuf.header.next = pid;
            store.write(&pbuf)?;
        }
        pages.push(pid);
        prev = pid;

        // Пустой документ: одна страница с data_len = 0.
        if n == 0 {
            break;
        }
        if n < PAGE_DATA_CAPACITY {
            break;
        }
    }

    Ok(WrittenChain {
        head: pages[0],
        pages: pages.clone(),
        total_len: total,
    })
}

/// Прочитать всю цепочку в память с верификацией инвариантов обхода.
pub fn read_chain(store: &PageStore, head: i32, verify: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if head == NO_PAGE {
        return Ok(out);
    }
    let mut pid = head;
    let mut last_version: Option<i32> = None;
    let mut seen: u32 = 0;

    while pid != NO_PAGE {
        seen += 1;
        if seen > MAX_CHAIN_PAGES {
            return Err(StreamDbError::CorruptChain {
                page: pid,
                reason: "chain exceeds maximum length (cycle?)".into(),
            });
        }
        let page = store.read(pid, verify)?;
        if let Some(last) = last_version {
            // Версия вдоль цепочки не убывает; убывание — след порванной
            // ротации, вызывающий уходит на prior-слот.
            if page.header.version < last {
                return Err(StreamDbError::CorruptChain {
                    page: pid,
                    reason: format!(
                        "version decreased along chain ({} -> {})",
                        last, page.header.version
                    ),
                });
            }
        }
        last_version = Some(page.header.version);
        out.extend_from_slice(&page.data);
        pid = page.header.next;
    }
    Ok(out)
}

/// Собрать id страниц цепочки (для карантина/освобождения/достижимости).
/// Best-effort: обрыв по ошибке чтения — недочитанный хвост подберёт
/// orphan sweep при следующем открытии.
pub fn collect_chain_pages(store: &PageStore, head: i32) -> Vec<i32> {
    let mut pages = Vec::new();
    let mut pid = head;
    let mut seen: u32 = 0;
    while pid != NO_PAGE && seen <= MAX_CHAIN_PAGES {
        match store.read(pid, false) {
            Ok(p) => {
                pages.push(pid);
                pid = p.header.next;
            }
            Err(e) => {
                debug!("chain walk stopped at page {}: {}", pid, e);
                break;
            }
        }
        seen += 1;
    }
    pages
}

/// Проверить обратные ссылки цепочки (используется при восстановлении,
/// не на горячем пути): next(p).prev == p.
pub fn verify_back_links(store: &PageStore, head: i32) -> Result<()> {
    let mut pid = head;
    let mut seen: u32 = 0;
    while pid != NO_PAGE && seen <= MAX_CHAIN_PAGES {
        let page = store.read(pid, true)?;
        let next = page.header.next;
        if next != NO_PAGE {
            let np = store.read(next, true)?;
            if np.header.prev != pid {
                return Err(StreamDbError::CorruptChain {
                    page: next,
                    reason: format!("prev {} does not match parent {}", np.header.prev, pid),
                });
            }
        }
        pid = next;
        seen += 1;
    }
    Ok(())
}

// ---------- Lazy reader ----------

/// Ленивая последовательность байт документа: страницы подгружаются по
/// мере чтения, между страницами никакие блокировки не удерживаются.
pub struct ChainReader {
    store: Arc<PageStore>,
    next: i32,
    buf: Vec<u8>,
    pos: usize,
    last_version: Option<i32>,
    seen: u32,
}

impl ChainReader {
    pub fn new(store: Arc<PageStore>, head: i32) -> Self {
        Self {
            store,
            next: head,
            buf: Vec::new(),
            pos: 0,
            last_version: None,
            seen: 0,
        }
    }

    fn load_next(&mut self) -> Result<bool> {
        if self.next == NO_PAGE {
            return Ok(false);
        }
        self.seen += 1;
        if self.seen > MAX_CHAIN_PAGES {
            return Err(StreamDbError::CorruptChain {
                page: self.next,
                reason: "chain exceeds maximum length (cycle?)".into(),
            });
        }
        let page = self.store.read(self.next, true)?;
        if let Some(last) = self.last_version {
            if page.header.version < last {
                return Err(StreamDbError::CorruptChain {
                    page: self.next,
                    reason: format!(
                        "version decreased along chain ({} -> {})",
                        last, page.header.version
                    ),
                });
            }
        }
        self.last_version = Some(page.header.version);
        self.next = page.header.next;
        self.buf = page.data;
        self.pos = 0;
        Ok(true)
    }
}

impl Read for ChainReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.buf.len() {
            match self.load_next() {
                Ok(true) => continue,
                Ok(false) => return Ok(0),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
