//! Database façade: композиция четырёх слоёв и иерархия блокировок.
//!
//! Порядок захвата (строго сверху вниз, без выхода из порядка):
//!   1) paths  (RwLock<PathIndex>)  — exclusive на bind/unbind и персист trie;
//!   2) docs   (RwLock<DocIndex>)   — exclusive на коммит таблицы/ротацию;
//!   3) alloc  (Mutex<Allocator>)   — на время allocate/free;
//!   4) header (Mutex<DbHeader>)    — состояние страницы 0;
//!   5) medium — внутри PageStore (читатели shared).
//!
//! Писатель НЕ держит paths/docs на время bulk-записи страниц документа:
//! цепочка пишется без верхних локов, коммит (вставка записи в таблицу,
//! перезапись таблицы, ротация корня) — короткая критическая секция.
//! Читатели берут paths/docs только на разрешение строки/записи и ходят
//! по цепочке вообще без верхних локов — прогресс читателей во время
//! длинных записей гарантирован политикой удержания трёх версий.
//!
//! Startup: проверка магии, разбор трёх versioned links (побеждает
//! старший слот с валидной целью), загрузка free-list -> таблицы -> trie,
//! при порче free-list — пересборка сканом, затем orphan sweep.

use std::collections::HashSet;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::chain::{self, ChainReader};
use crate::config::Config;
use crate::consts::{
    FIRST_CONTENT_PAGE, FLAG_DATA, FLAG_INDEX, FLAG_TRIE, FREE_OFF_IDS, FREE_OFF_NEXT,
    FREE_OFF_USED, NO_PAGE,
};
use crate::error::{Result, StreamDbError};
use crate::freelist::Allocator;
use crate::header::{DbHeader, LinkRepair, LinkSlot, VersionedLink};
use crate::index::{DocIndex, IndexEntry};
use crate::lock::{self, LockGuard};
use crate::medium::{FileMedium, Medium, MemoryMedium};
use crate::metrics::{
    record_orphans_reclaimed, record_prior_fallback, record_root_rotation,
    record_trie_persist,
};
use crate::page;
use crate::store::{self, PageStore};
use crate::trie::PathIndex;

/// Итог `statistics()`: всего страниц в файле и свободных.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_pages: i64,
    pub free_pages: i64,
}

/// Ленивый итератор путей (search / list_paths). Результат снимается под
/// локом индекса и отдаётся наружу владеемым, чтобы не держать локи
/// через пользовательский код.
pub struct PathIter {
    inner: std::vec::IntoIter<String>,
}

impl Iterator for PathIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.inner.next()
    }
}

impl PathIter {
    fn new(mut paths: Vec<String>) -> Self {
        paths.sort();
        Self {
            inner: paths.into_iter(),
        }
    }
}

/// Ленивое чтение документа: страницы подгружаются по мере чтения.
pub struct DocReader {
    inner: ChainReader,
}

impl Read for DocReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(out)
    }
}

#[derive(Clone, Copy)]
enum RootKind {
    Index,
    PathLookup,
}

pub struct StreamDb {
    cfg: Config,
    store: Arc<PageStore>,
    paths: RwLock<PathIndex>,
    docs: RwLock<DocIndex>,
    alloc: Mutex<Allocator>,
    header: Mutex<DbHeader>,
    path_cache: Mutex<Option<LruCache<String, Uuid>>>,
    _file_lock: Option<LockGuard>,
}

impl StreamDb {
    // ---------- Constructors ----------

    /// Создать новый файл БД. Ошибка, если файл уже существует.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_config(path, Config::from_env())
    }

    pub fn create_with_config(path: &Path, cfg: Config) -> Result<Self> {
        let file_lock = lock::acquire_exclusive(path)?;
        let medium = FileMedium::create(path)?;
        let store = PageStore::new(Box::new(medium), cfg.page_cache_pages);
        bootstrap(&store)?;
        Self::finish_open(cfg, Arc::new(store), Some(file_lock))
    }

    /// Открыть существующий файл БД (с восстановлением).
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, Config::from_env())
    }

    pub fn open_with_config(path: &Path, cfg: Config) -> Result<Self> {
        let file_lock = lock::acquire_exclusive(path)?;
        let medium = FileMedium::open(path)?;
        let store = PageStore::new(Box::new(medium), cfg.page_cache_pages);
        Self::finish_open(cfg, Arc::new(store), Some(file_lock))
    }

    /// Полностью in-memory БД (тесты, volatile-сценарии).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(Config::default())
    }

    pub fn in_memory_with_config(cfg: Config) -> Result<Self> {
        let store = PageStore::new(Box::new(MemoryMedium::new()), cfg.page_cache_pages);
        bootstrap(&store)?;
        Self::finish_open(cfg, Arc::new(store), None)
    }

    /// Открыть поверх произвольного носителя с уже существующим
    /// содержимым (байты должны начинаться со страницы-заголовка).
    pub fn open_medium(medium: Box<dyn Medium>, cfg: Config) -> Result<Self> {
        let store = PageStore::new(medium, cfg.page_cache_pages);
        if store.len_pages()? == 0 {
            bootstrap(&store)?;
        }
        Self::finish_open(cfg, Arc::new(store), None)
    }

    fn finish_open(cfg: Config, store: Arc<PageStore>, file_lock: Option<LockGuard>) -> Result<Self> {
        let mut hdr = DbHeader::read(&store)?;

        // Разбор незавершённых ротаций: среди слотов побеждает старший по
        // версии с валидной целью. Проверка строгая, в обход quick mode.
        let probe = |pid: i32| -> bool {
            store
                .read_raw(pid)
                .map(|b| page::crc_verify(&b))
                .unwrap_or(false)
        };
        let index_repair = crate::header::resolve_link("indirection root", &mut hdr.index_root, probe);
        let path_repair = crate::header::resolve_link("path lookup root", &mut hdr.path_root, probe);
        let free_repair = crate::header::resolve_link("free list root", &mut hdr.free_root, probe);
        let repaired = [index_repair, path_repair, free_repair]
            .iter()
            .any(|r| !matches!(r, LinkRepair::Intact | LinkRepair::Empty));
        if repaired {
            hdr.write(&store)?;
            store.flush()?;
        }

        // Free-list первым (он может понадобиться восстановлению),
        // затем таблица, затем trie — фиксированный порядок bootstrap.
        let mut alloc = Allocator::new(cfg.hot_list_limit, cfg.grow_batch_pages, cfg.max_db_bytes);
        let mut needs_rebuild = matches!(free_repair, LinkRepair::AllInvalid);
        if !needs_rebuild {
            if let Err(e) = alloc.attach(&store, hdr.free_root.current.page_id) {
                warn!("free list unreadable ({}), scheduling scan rebuild", e);
                needs_rebuild = true;
            }
        }

        let docs = load_table(&store, &hdr.index_root)?;
        let paths = load_trie(&store, &hdr.path_root)?;

        // Обратные ссылки цепочек проверяются здесь, не на горячем пути.
        if cfg.sweep_on_open {
            for (id, entry) in docs.iter() {
                if let Err(e) = chain::verify_back_links(&store, entry.first_page) {
                    warn!("back links of document {} inconsistent: {}", id, e);
                }
            }
        }

        // Достижимость: служебные страницы, цепочки всех слотов трёх
        // корней, цепочки документов из каждой читаемой таблицы.
        if needs_rebuild || cfg.sweep_on_open {
            let reachable = collect_reachable(&store, &hdr);
            let total = store.len_pages()?;
            if needs_rebuild {
                alloc.rebuild(&store, &reachable, total)?;
            } else {
                let free_set = collect_free_set(&store, hdr.free_root.current.page_id);
                let mut orphans = 0u64;
                for pid in FIRST_CONTENT_PAGE..total {
                    if !reachable.contains(&pid) && !free_set.contains(&pid) {
                        alloc.free(&store, pid)?;
                        orphans += 1;
                    }
                }
                if orphans > 0 {
                    info!("reclaimed {} orphan pages on open", orphans);
                    record_orphans_reclaimed(orphans);
                }
            }
            if let Some(root) = alloc.take_root_change() {
                advance_free_root(&mut hdr, root);
                hdr.write(&store)?;
                store.flush()?;
            }
        }

        if cfg.quick_mode {
            store::set_quick_mode(true);
        }

        let path_cache = NonZeroUsize::new(cfg.path_cache_entries).map(LruCache::new);

        debug!("open complete: {} documents, {} bound paths", docs.len(), paths.bound_paths());
        Ok(Self {
            cfg,
            store,
            paths: RwLock::new(paths),
            docs: RwLock::new(docs),
            alloc: Mutex::new(alloc),
            header: Mutex::new(hdr),
            path_cache: Mutex::new(path_cache),
            _file_lock: file_lock,
        })
    }

    // ---------- Public operations ----------

    /// Записать документ по пути. Существующий путь перезаписывается
    /// (новая цепочка, прежняя уходит в карантин); новый путь получает
    /// свежий id и привязку.
    pub fn write_document(&self, path: &str, source: &mut dyn Read) -> Result<Uuid> {
        let existing = self.lookup_id(path);
        let (id, version) = match existing {
            Some(id) => {
                let v = self
                    .docs
                    .read()
                    .get(&id)
                    .map(|e| e.version.wrapping_add(1))
                    .unwrap_or(1);
                (id, v)
            }
            None => (Uuid::new_v4(), 1),
        };

        // Bulk-запись цепочки без верхних локов: читатели не страдают.
        let written = chain::write_chain(&self.store, &self.alloc, source, version, FLAG_DATA)?;
        self.store.flush()?;

        // Короткий коммит: вставка в таблицу + ротация корня.
        let old = {
            let mut docs = self.docs.write();
            let old = docs.insert(
                id,
                IndexEntry {
                    first_page: written.head,
                    version,
                },
            );
            self.rotate_root(RootKind::Index, &docs.serialize())?;
            old
        };
        if let Some(old) = old {
            let pages = chain::collect_chain_pages(&self.store, old.first_page);
            self.alloc.lock().quarantine(pages);
        }

        if existing.is_none() {
            let mut paths = self.paths.write();
            paths.bind(path, id);
            self.persist_paths(&paths)?;
        }
        self.path_cache_put(path, id);
        Ok(id)
    }

    /// Прочитать документ по пути. Отсутствующий путь — Ok(None), порча
    /// цепочки после отката на prior — ошибка, отличимая от not-found.
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let id = match self.lookup_id(path) {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.read_document(id) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StreamDbError::UnknownId(_)) => {
                // Привязка пережила документ (гонка с delete) — not-found.
                self.path_cache_invalidate(path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Прочитать документ по id.
    pub fn read_document(&self, id: Uuid) -> Result<Vec<u8>> {
        let entry = self
            .docs
            .read()
            .get(&id)
            .ok_or(StreamDbError::UnknownId(id))?;
        match chain::read_chain(&self.store, entry.first_page, true) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_corruption() => {
                warn!("chain for {} corrupt ({}), retrying via prior table", id, e);
                self.read_via_prior(id).map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }

    /// Ленивое чтение: `Read` поверх цепочки страниц.
    pub fn open_reader(&self, path: &str) -> Result<Option<DocReader>> {
        let id = match self.lookup_id(path) {
            Some(id) => id,
            None => return Ok(None),
        };
        let entry = match self.docs.read().get(&id) {
            Some(e) => e,
            None => return Ok(None),
        };
        Ok(Some(DocReader {
            inner: ChainReader::new(self.store.clone(), entry.first_page),
        }))
    }

    pub fn get_id_by_path(&self, path: &str) -> Option<Uuid> {
        self.lookup_id(path)
    }

    /// Удалить документ по пути. Отсутствие пути — молча Ok.
    pub fn delete(&self, path: &str) -> Result<()> {
        match self.lookup_id(path) {
            Some(id) => self.delete_by_id(id),
            None => Ok(()),
        }
    }

    /// Удалить документ: снять все привязки, убрать запись из таблицы,
    /// цепочку — в карантин. Идемпотентно.
    pub fn delete_by_id(&self, id: Uuid) -> Result<()> {
        let mut paths = self.paths.write();
        let removed_paths = paths.unbind_all(id);
        if !removed_paths.is_empty() {
            self.persist_paths(&paths)?;
        }
        drop(paths);
        for p in &removed_paths {
            self.path_cache_invalidate(p);
        }

        let entry = {
            let mut docs = self.docs.write();
            match docs.remove(&id) {
                Some(e) => {
                    self.rotate_root(RootKind::Index, &docs.serialize())?;
                    Some(e)
                }
                None => None, // идемпотентность: не найдено — молча
            }
        };
        if let Some(entry) = entry {
            let pages = chain::collect_chain_pages(&self.store, entry.first_page);
            self.alloc.lock().quarantine(pages);
        }
        Ok(())
    }

    /// Привязать ещё один путь к id. Занятый путь перепривязывается.
    pub fn bind_to_path(&self, id: Uuid, path: &str) -> Result<()> {
        if !self.docs.read().contains(&id) {
            return Err(StreamDbError::UnknownId(id));
        }
        let mut paths = self.paths.write();
        let replaced = paths.bind(path, id);
        self.persist_paths(&paths)?;
        drop(paths);
        if let Some(old) = replaced {
            debug!("path {} rebound from {} to {}", path, old, id);
        }
        self.path_cache_put(path, id);
        Ok(())
    }

    /// Снять привязку пути к id. Молча, если привязки нет.
    pub fn unbind_path(&self, id: Uuid, path: &str) -> Result<()> {
        let mut paths = self.paths.write();
        if paths.unbind_for(id, path) {
            self.persist_paths(&paths)?;
        }
        drop(paths);
        self.path_cache_invalidate(path);
        Ok(())
    }

    /// Все привязанные пути, начинающиеся с prefix.
    pub fn search(&self, prefix: &str) -> PathIter {
        PathIter::new(self.paths.read().search(prefix))
    }

    /// Пути документа. `UnknownId`, если документа нет.
    pub fn list_paths(&self, id: Uuid) -> Result<PathIter> {
        if !self.docs.read().contains(&id) {
            return Err(StreamDbError::UnknownId(id));
        }
        Ok(PathIter::new(self.paths.read().paths_for(id)))
    }

    /// Сбросить hot-list на диск и форсировать носитель.
    pub fn flush(&self) -> Result<()> {
        {
            let mut alloc = self.alloc.lock();
            alloc.drain_hot(&self.store)?;
            if let Some(root) = alloc.take_root_change() {
                let mut hdr = self.header.lock();
                advance_free_root(&mut hdr, root);
                hdr.write(&self.store)?;
            }
        }
        self.store.flush()
    }

    pub fn statistics(&self) -> Result<Stats> {
        Ok(Stats {
            total_pages: self.store.len_pages()? as i64,
            free_pages: self.alloc.lock().count() as i64,
        })
    }

    /// Процессный переключатель: выключить проверку CRC на чтениях.
    pub fn set_quick_mode(&self, on: bool) {
        store::set_quick_mode(on);
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    // ---------- Internals ----------

    fn lookup_id(&self, path: &str) -> Option<Uuid> {
        {
            let mut cache = self.path_cache.lock();
            if let Some(c) = cache.as_mut() {
                if let Some(id) = c.get(path) {
                    return Some(*id);
                }
            }
        }
        let id = self.paths.read().lookup(path)?;
        self.path_cache_put(path, id);
        Some(id)
    }

    fn path_cache_put(&self, path: &str, id: Uuid) {
        let mut cache = self.path_cache.lock();
        if let Some(c) = cache.as_mut() {
            c.put(path.to_string(), id);
        }
    }

    fn path_cache_invalidate(&self, path: &str) {
        let mut cache = self.path_cache.lock();
        if let Some(c) = cache.as_mut() {
            c.pop(path);
        }
    }

    /// Переписать корневой документ (таблицу или trie) и провернуть его
    /// versioned link. Порядок: страницы -> flush -> pending -> flush ->
    /// ротация -> flush. Выпавшая prior-цепочка уходит в free-list,
    /// ротация indirection-корня выпускает дозревший карантин.
    fn rotate_root(&self, kind: RootKind, bytes: &[u8]) -> Result<()> {
        let version = {
            let hdr = self.header.lock();
            let link = match kind {
                RootKind::Index => &hdr.index_root,
                RootKind::PathLookup => &hdr.path_root,
            };
            link.current.version.wrapping_add(1)
        };
        let flags = match kind {
            RootKind::Index => FLAG_INDEX,
            RootKind::PathLookup => FLAG_TRIE,
        };

        let mut cursor = bytes;
        let written = chain::write_chain(&self.store, &self.alloc, &mut cursor, version, flags)?;
        self.store.flush()?;

        let dropped = {
            let mut hdr = self.header.lock();
            let link = match kind {
                RootKind::Index => &mut hdr.index_root,
                RootKind::PathLookup => &mut hdr.path_root,
            };
            link.stage(written.head);
            hdr.write(&self.store)?;
            self.store.flush()?;

            let link = match kind {
                RootKind::Index => &mut hdr.index_root,
                RootKind::PathLookup => &mut hdr.path_root,
            };
            let dropped = link.rotate();
            hdr.write(&self.store)?;
            self.store.flush()?;
            dropped
        };
        record_root_rotation();

        {
            let mut alloc = self.alloc.lock();
            if dropped.page_id != NO_PAGE {
                // Третья ротация позади: цепочка выпала из prior-слота.
                let pages = chain::collect_chain_pages(&self.store, dropped.page_id);
                alloc.free_many(&self.store, &pages)?;
            }
            if matches!(kind, RootKind::Index) {
                alloc.on_rotation(&self.store)?;
            }
            if let Some(root) = alloc.take_root_change() {
                let mut hdr = self.header.lock();
                advance_free_root(&mut hdr, root);
                hdr.write(&self.store)?;
            }
        }
        Ok(())
    }

    /// Персист trie под удерживаемым path-локом.
    fn persist_paths(&self, paths: &PathIndex) -> Result<()> {
        self.rotate_root(RootKind::PathLookup, &paths.serialize())?;
        record_trie_persist();
        Ok(())
    }

    /// Чтение через prior-слот indirection-корня: для читателя, который
    /// напоролся на порванную ротацию или побитую страницу.
    fn read_via_prior(&self, id: Uuid) -> Result<Vec<u8>> {
        let prior = {
            let hdr = self.header.lock();
            hdr.index_root.prior
        };
        if prior.is_empty() {
            return Err(StreamDbError::TornRotation("no prior slot to fall back to"));
        }
        let table_bytes = chain::read_chain(&self.store, prior.page_id, true)?;
        let table = DocIndex::deserialize(&table_bytes)?;
        let entry = table.get(&id).ok_or(StreamDbError::UnknownId(id))?;
        let bytes = chain::read_chain(&self.store, entry.first_page, true)?;
        record_prior_fallback();
        Ok(bytes)
    }
}

impl Drop for StreamDb {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("flush on drop failed: {}", e);
        }
    }
}

// ---------- Open-time helpers ----------

/// Инициализация пустого файла: заголовок + три зарезервированные
/// страницы нулями. Корневые документы создаются лениво, первым всегда
/// появляется free-list (его корень двигается любой первой записью).
fn bootstrap(store: &PageStore) -> Result<()> {
    store.grow_to_pages(FIRST_CONTENT_PAGE)?;
    DbHeader::empty().write(store)?;
    store.flush()
}

fn advance_free_root(hdr: &mut DbHeader, root: i32) {
    // Free-root держит раскладку versioned link, но двигается только
    // current-слот: free-list переписывается на месте и при порче
    // восстанавливается сканом, shadow-страницы ему ничего не дают.
    let v = hdr.free_root.current.version.wrapping_add(1);
    hdr.free_root.current = LinkSlot {
        page_id: root,
        version: v,
    };
    hdr.free_root.prior = LinkSlot::EMPTY;
    hdr.free_root.pending = LinkSlot::EMPTY;
}

/// Загрузить indirection-таблицу: current, при порче — prior.
fn load_table(store: &PageStore, link: &VersionedLink) -> Result<DocIndex> {
    if link.current.is_empty() {
        return Ok(DocIndex::new());
    }
    match chain::read_chain(store, link.current.page_id, true)
        .and_then(|b| DocIndex::deserialize(&b))
    {
        Ok(t) => Ok(t),
        Err(e) if e.is_corruption() && !link.prior.is_empty() => {
            warn!("indirection table corrupt ({}), loading prior slot", e);
            record_prior_fallback();
            let bytes = chain::read_chain(store, link.prior.page_id, true)?;
            DocIndex::deserialize(&bytes)
        }
        Err(e) => Err(e),
    }
}

/// Загрузить path trie: current, при порче — prior.
fn load_trie(store: &PageStore, link: &VersionedLink) -> Result<PathIndex> {
    if link.current.is_empty() {
        return Ok(PathIndex::new());
    }
    match chain::read_chain(store, link.current.page_id, true)
        .and_then(|b| PathIndex::deserialize(&b))
    {
        Ok(t) => Ok(t),
        Err(e) if e.is_corruption() && !link.prior.is_empty() => {
            warn!("path trie corrupt ({}), loading prior slot", e);
            record_prior_fallback();
            let bytes = chain::read_chain(store, link.prior.page_id, true)?;
            PathIndex::deserialize(&bytes)
        }
        Err(e) => Err(e),
    }
}

/// Достижимые страницы: служебные, цепочки всех слотов трёх корней и
/// цепочки документов из каждой читаемой версии таблицы (prior-таблицы
/// удерживают свои цепочки до конца retention-окна).
fn collect_reachable(store: &PageStore, hdr: &DbHeader) -> HashSet<i32> {
    let mut reachable: HashSet<i32> = (0..FIRST_CONTENT_PAGE).collect();

    let slots = |l: &VersionedLink| [l.prior, l.current, l.pending];

    for slot in slots(&hdr.path_root) {
        if !slot.is_empty() {
            reachable.extend(chain::collect_chain_pages(store, slot.page_id));
        }
    }
    for slot in slots(&hdr.index_root) {
        if slot.is_empty() {
            continue;
        }
        reachable.extend(chain::collect_chain_pages(store, slot.page_id));
        let table = match chain::read_chain(store, slot.page_id, true)
            .and_then(|b| DocIndex::deserialize(&b))
        {
            Ok(t) => t,
            Err(e) => {
                debug!("skipping unreadable table at page {}: {}", slot.page_id, e);
                continue;
            }
        };
        for (_, entry) in table.iter() {
            reachable.extend(chain::collect_chain_pages(store, entry.first_page));
        }
    }
    reachable
}

/// Страницы free-list: контейнеры и записи. Best-effort — обрыв на
/// первой порче (дальше решает rebuild).
fn collect_free_set(store: &PageStore, root: i32) -> HashSet<i32> {
    let mut set = HashSet::new();
    let mut pid = root;
    while pid != NO_PAGE {
        let buf = match store.read_raw(pid) {
            Ok(b) if page::crc_verify(&b) => b,
            _ => break,
        };
        set.insert(pid);
        let used = LittleEndian::read_i32(&buf[FREE_OFF_USED..FREE_OFF_USED + 4]);
        for i in 0..used.max(0) as usize {
            let off = FREE_OFF_IDS + i * 4;
            set.insert(LittleEndian::read_i32(&buf[off..off + 4]));
        }
        pid = LittleEndian::read_i32(&buf[FREE_OFF_NEXT..FREE_OFF_NEXT + 4]);
        if set.len() > store.len_pages().unwrap_or(0) as usize * 2 {
            break; // защита от цикла в порченой цепочке
        }
    }
    set
}
