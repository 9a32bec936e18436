//! Database header (страница 0) и versioned links.
//!
//! Layout страницы 0:
//!   [magic 8B = 55 AA FE ED FA CE DA 7A]
//!   [indirection-root link 24B]
//!   [path-lookup-root link 24B]
//!   [free-list-root link 24B]
//!   [нули до конца страницы]
//!
//! Versioned link — три слота [page_id i32][version i32] в порядке
//! prior / current / pending. Протокол записи нового корня:
//!   1) писатель заполняет pending (новая голова, version+1) и флашит;
//!   2) ротация: pending->current, current->prior; старый prior выпадает
//!      и освобождается (политика удержания трёх версий).
//! Читатели ходят по current; при несовпадении CRC откатываются на prior.
//!
//! Сам header CRC не несёт: незавершённую ротацию разруливают версии
//! слотов (при открытии побеждает старший слот с валидной целью).

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use crate::consts::{
    HEADER_PAGE_ID, LINK_SIZE, MAGIC, NO_PAGE, OFF_FREE_ROOT, OFF_INDEX_ROOT,
    OFF_PATH_ROOT, PAGE_SIZE,
};
use crate::error::{Result, StreamDbError};
use crate::store::PageStore;

// ---------- Slots and links ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSlot {
    pub page_id: i32,
    pub version: i32,
}

impl LinkSlot {
    pub const EMPTY: LinkSlot = LinkSlot {
        page_id: NO_PAGE,
        version: 0,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id == NO_PAGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedLink {
    pub prior: LinkSlot,
    pub current: LinkSlot,
    pub pending: LinkSlot,
}

impl VersionedLink {
    pub const EMPTY: VersionedLink = VersionedLink {
        prior: LinkSlot::EMPTY,
        current: LinkSlot::EMPTY,
        pending: LinkSlot::EMPTY,
    };

    /// Заполнить pending-слот новой головой. Версия — current + 1.
    pub fn stage(&mut self, new_head: i32) {
        self.pending = LinkSlot {
            page_id: new_head,
            version: self.current.version.wrapping_add(1),
        };
    }

    /// Ротация pending->current->prior. Возвращает выпавший prior-слот —
    /// его цепочка подлежит освобождению.
    pub fn rotate(&mut self) -> LinkSlot {
        debug_assert!(!self.pending.is_empty(), "rotate without staged pending");
        let dropped = self.prior;
        self.prior = self.current;
        self.current = self.pending;
        self.pending = LinkSlot::EMPTY;
        dropped
    }

    pub fn decode(buf: &[u8]) -> VersionedLink {
        debug_assert!(buf.len() >= LINK_SIZE);
        let slot = |off: usize| LinkSlot {
            page_id: LittleEndian::read_i32(&buf[off..off + 4]),
            version: LittleEndian::read_i32(&buf[off + 4..off + 8]),
        };
        VersionedLink {
            prior: slot(0),
            current: slot(8),
            pending: slot(16),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= LINK_SIZE);
        let mut put = |off: usize, s: &LinkSlot| {
            LittleEndian::write_i32(&mut buf[off..off + 4], s.page_id);
            LittleEndian::write_i32(&mut buf[off + 4..off + 8], s.version);
        };
        put(0, &self.prior);
        put(8, &self.current);
        put(16, &self.pending);
    }
}

// ---------- Header page ----------

#[derive(Debug, Clone, Copy)]
pub struct DbHeader {
    pub index_root: VersionedLink,
    pub path_root: VersionedLink,
    pub free_root: VersionedLink,
}

impl DbHeader {
    pub fn empty() -> Self {
        Self {
            index_root: VersionedLink::EMPTY,
            path_root: VersionedLink::EMPTY,
            free_root: VersionedLink::EMPTY,
        }
    }

    pub fn read(store: &PageStore) -> Result<Self> {
        let buf = store.read_raw(HEADER_PAGE_ID)?;
        if buf[0..8] != MAGIC {
            return Err(StreamDbError::BadMagic);
        }
        Ok(Self {
            index_root: VersionedLink::decode(&buf[OFF_INDEX_ROOT..OFF_INDEX_ROOT + LINK_SIZE]),
            path_root: VersionedLink::decode(&buf[OFF_PATH_ROOT..OFF_PATH_ROOT + LINK_SIZE]),
            free_root: VersionedLink::decode(&buf[OFF_FREE_ROOT..OFF_FREE_ROOT + LINK_SIZE]),
        })
    }

    pub fn write(&self, store: &PageStore) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        self.index_root
            .encode(&mut buf[OFF_INDEX_ROOT..OFF_INDEX_ROOT + LINK_SIZE]);
        self.path_root
            .encode(&mut buf[OFF_PATH_ROOT..OFF_PATH_ROOT + LINK_SIZE]);
        self.free_root
            .encode(&mut buf[OFF_FREE_ROOT..OFF_FREE_ROOT + LINK_SIZE]);
        store.write_raw(HEADER_PAGE_ID, &buf)
    }
}

// ---------- Open-time link resolution ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRepair {
    /// current валиден, pending пуст — ничего не делали.
    Intact,
    /// pending оказался старшим валидным слотом — доведена ротация.
    CompletedRotation,
    /// current не прошёл проверку — откат на prior.
    FellBackToPrior,
    /// Все слоты пусты.
    Empty,
    /// Непустые слоты есть, но ни один не прошёл проверку.
    AllInvalid,
}

/// Разрулить незавершённую ротацию: среди непустых слотов побеждает
/// старший по версии, чья целевая страница проходит `probe`.
pub fn resolve_link<F>(name: &str, link: &mut VersionedLink, mut probe: F) -> LinkRepair
where
    F: FnMut(i32) -> bool,
{
    let mut candidates: Vec<(LinkSlot, u8)> = Vec::with_capacity(3);
    // tag: 0=pending, 1=current, 2=prior
    for (slot, tag) in [(link.pending, 0u8), (link.current, 1u8), (link.prior, 2u8)] {
        if !slot.is_empty() {
            candidates.push((slot, tag));
        }
    }
    if candidates.is_empty() {
        return LinkRepair::Empty;
    }
    candidates.sort_by(|a, b| b.0.version.cmp(&a.0.version));

    for (slot, tag) in candidates {
        if !probe(slot.page_id) {
            continue;
        }
        return match tag {
            0 => {
                // Флаш данных прошёл, ротация header не дописана — доводим.
                info!("{}: completing torn rotation to page {}", name, slot.page_id);
                link.prior = link.current;
                link.current = slot;
                link.pending = LinkSlot::EMPTY;
                LinkRepair::CompletedRotation
            }
            1 => {
                if !link.pending.is_empty() {
                    // pending был старше, но невалиден — бросаем его.
                    warn!("{}: discarding invalid pending slot", name);
                    link.pending = LinkSlot::EMPTY;
                }
                LinkRepair::Intact
            }
            _ => {
                warn!(
                    "{}: current slot unreadable, falling back to prior page {}",
                    name, slot.page_id
                );
                link.current = slot;
                link.pending = LinkSlot::EMPTY;
                LinkRepair::FellBackToPrior
            }
        };
    }

    warn!("{}: no readable slot in versioned link", name);
    *link = VersionedLink::EMPTY;
    LinkRepair::AllInvalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::{MemoryMedium, Medium};

    fn mem_store() -> PageStore {
        let m = MemoryMedium::new();
        m.grow(4 * PAGE_SIZE as u64).unwrap();
        PageStore::new(Box::new(m), 0)
    }

    #[test]
    fn link_codec_roundtrip() {
        let link = VersionedLink {
            prior: LinkSlot { page_id: 4, version: 1 },
            current: LinkSlot { page_id: 9, version: 2 },
            pending: LinkSlot::EMPTY,
        };
        let mut buf = [0u8; LINK_SIZE];
        link.encode(&mut buf);
        assert_eq!(VersionedLink::decode(&buf), link);
    }

    #[test]
    fn stage_then_rotate() {
        let mut link = VersionedLink::EMPTY;
        link.stage(4);
        assert_eq!(link.pending, LinkSlot { page_id: 4, version: 1 });
        let dropped = link.rotate();
        assert!(dropped.is_empty());
        assert_eq!(link.current, LinkSlot { page_id: 4, version: 1 });

        link.stage(7);
        link.rotate();
        link.stage(12);
        let dropped = link.rotate();
        // Первая голова продержалась две ротации и выпала на третьей.
        assert_eq!(dropped.page_id, 4);
        assert_eq!(link.prior.page_id, 7);
        assert_eq!(link.current.page_id, 12);
    }

    #[test]
    fn header_roundtrip_and_magic() {
        let store = mem_store();
        let mut h = DbHeader::empty();
        h.index_root.stage(4);
        h.index_root.rotate();
        h.write(&store).unwrap();

        let got = DbHeader::read(&store).unwrap();
        assert_eq!(got.index_root.current.page_id, 4);
        assert_eq!(got.path_root, VersionedLink::EMPTY);

        // Ломаем магию.
        let mut raw = store.read_raw(0).unwrap();
        raw[0] = 0x00;
        store.write_raw(0, &raw).unwrap();
        assert!(matches!(DbHeader::read(&store), Err(StreamDbError::BadMagic)));
    }

    #[test]
    fn resolve_prefers_valid_pending() {
        let mut link = VersionedLink {
            prior: LinkSlot { page_id: 4, version: 1 },
            current: LinkSlot { page_id: 7, version: 2 },
            pending: LinkSlot { page_id: 12, version: 3 },
        };
        let r = resolve_link("test", &mut link, |_| true);
        assert_eq!(r, LinkRepair::CompletedRotation);
        assert_eq!(link.current.page_id, 12);
        assert_eq!(link.prior.page_id, 7);
        assert!(link.pending.is_empty());
    }

    #[test]
    fn resolve_falls_back_when_current_bad() {
        let mut link = VersionedLink {
            prior: LinkSlot { page_id: 4, version: 1 },
            current: LinkSlot { page_id: 7, version: 2 },
            pending: LinkSlot::EMPTY,
        };
        let r = resolve_link("test", &mut link, |pid| pid == 4);
        assert_eq!(r, LinkRepair::FellBackToPrior);
        assert_eq!(link.current.page_id, 4);
    }

    #[test]
    fn resolve_discards_bad_pending() {
        let mut link = VersionedLink {
            prior: LinkSlot::EMPTY,
            current: LinkSlot { page_id: 7, version: 2 },
            pending: LinkSlot { page_id: 12, version: 3 },
        };
        let r = resolve_link("test", &mut link, |pid| pid == 7);
        assert_eq!(r, LinkRepair::Intact);
        assert!(link.pending.is_empty());
        assert_eq!(link.current.page_id, 7);
    }
}
