//! Формат страницы.
//!
//! Layout (4096 байт):
//!   [crc u32]        -- CRC32 (IEEE) по байтам [4..4096]
//!   [version i32]    -- версия документа, которой помечена страница
//!   [prev i32]       -- предыдущая страница цепочки или NO_PAGE
//!   [next i32]       -- следующая страница цепочки или NO_PAGE
//!   [flags u8]       -- тип страницы (FLAG_*)
//!   [data_len i32]   -- байт полезной нагрузки, 0..=4061
//!   [reserved 14B]   -- нули
//!   [payload 4061B]
//!
//! Инварианты:
//! - data_len <= PAGE_DATA_CAPACITY;
//! - верифицированное чтение требует совпадения CRC;
//! - если next != NO_PAGE, то prev следующей страницы равен id этой
//!   (проверяется при восстановлении, не на горячем пути).

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    NO_PAGE, OFF_DATA_LEN, OFF_FLAGS, OFF_NEXT, OFF_PREV, OFF_VERSION,
    PAGE_DATA_CAPACITY, PAGE_HDR_SIZE, PAGE_SIZE,
};
use crate::error::{Result, StreamDbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub version: i32,
    pub prev: i32,
    pub next: i32,
    pub flags: u8,
    pub data_len: i32,
}

impl PageHeader {
    pub fn new(flags: u8, version: i32) -> Self {
        Self {
            version,
            prev: NO_PAGE,
            next: NO_PAGE,
            flags,
            data_len: 0,
        }
    }
}

/// Распарсенная страница: заголовок + копия полезной нагрузки.
/// Именно в таком виде страницы лежат в кэше page store.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: i32,
    pub header: PageHeader,
    pub data: Vec<u8>,
}

impl Page {
    pub fn new(id: i32, flags: u8, version: i32) -> Self {
        Self {
            id,
            header: PageHeader::new(flags, version),
            data: Vec::new(),
        }
    }

    pub fn set_data(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= PAGE_DATA_CAPACITY);
        self.data.clear();
        self.data.extend_from_slice(data);
        self.header.data_len = data.len() as i32;
    }
}

// ---------- CRC ----------

/// CRC32 по байтам [4..PAGE_SIZE]. Общая для обычных и free-list страниц.
#[inline]
pub fn crc_compute(buf: &[u8; PAGE_SIZE]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&buf[4..]);
    h.finalize()
}

/// Пересчитать и вписать CRC в байты [0..4].
pub fn crc_update(buf: &mut [u8; PAGE_SIZE]) {
    let crc = crc_compute(buf);
    LittleEndian::write_u32(&mut buf[0..4], crc);
}

/// true, если записанный CRC совпадает с пересчитанным.
pub fn crc_verify(buf: &[u8; PAGE_SIZE]) -> bool {
    let stored = LittleEndian::read_u32(&buf[0..4]);
    stored == crc_compute(buf)
}

// ---------- Header codec ----------

pub fn header_read(page_id: i32, buf: &[u8; PAGE_SIZE]) -> Result<PageHeader> {
    let version = LittleEndian::read_i32(&buf[OFF_VERSION..OFF_VERSION + 4]);
    let prev = LittleEndian::read_i32(&buf[OFF_PREV..OFF_PREV + 4]);
    let next = LittleEndian::read_i32(&buf[OFF_NEXT..OFF_NEXT + 4]);
    let flags = buf[OFF_FLAGS];
    let data_len = LittleEndian::read_i32(&buf[OFF_DATA_LEN..OFF_DATA_LEN + 4]);

    if data_len < 0 || data_len as usize > PAGE_DATA_CAPACITY {
        return Err(StreamDbError::CorruptChain {
            page: page_id,
            reason: format!("data_len {} out of bounds", data_len),
        });
    }
    Ok(PageHeader {
        version,
        prev,
        next,
        flags,
        data_len,
    })
}

pub fn header_write(buf: &mut [u8; PAGE_SIZE], h: &PageHeader) {
    // CRC (байты [0..4]) вписывается отдельно, после заполнения payload.
    for b in &mut buf[OFF_VERSION..PAGE_HDR_SIZE] {
        *b = 0;
    }
    LittleEndian::write_i32(&mut buf[OFF_VERSION..OFF_VERSION + 4], h.version);
    LittleEndian::write_i32(&mut buf[OFF_PREV..OFF_PREV + 4], h.prev);
    LittleEndian::write_i32(&mut buf[OFF_NEXT..OFF_NEXT + 4], h.next);
    buf[OFF_FLAGS] = h.flags;
    LittleEndian::write_i32(&mut buf[OFF_DATA_LEN..OFF_DATA_LEN + 4], h.data_len);
}

/// Собрать полный 4096-байтовый образ страницы с пересчитанным CRC.
pub fn encode(page: &Page) -> [u8; PAGE_SIZE] {
    let mut buf = [0u8; PAGE_SIZE];
    header_write(&mut buf, &page.header);
    let n = page.data.len().min(PAGE_DATA_CAPACITY);
    buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + n].copy_from_slice(&page.data[..n]);
    crc_update(&mut buf);
    buf
}

/// Распарсить образ страницы. CRC здесь не проверяется — это решение
/// page store (quick mode / verify-флаг).
pub fn decode(page_id: i32, buf: &[u8; PAGE_SIZE]) -> Result<Page> {
    let header = header_read(page_id, buf)?;
    let n = header.data_len as usize;
    Ok(Page {
        id: page_id,
        header,
        data: buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + n].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::FLAG_DATA;

    #[test]
    fn header_roundtrip() {
        let mut buf = [0u8; PAGE_SIZE];
        let h = PageHeader {
            version: 7,
            prev: 12,
            next: NO_PAGE,
            flags: FLAG_DATA,
            data_len: 4061,
        };
        header_write(&mut buf, &h);
        let got = header_read(5, &buf).unwrap();
        assert_eq!(got, h);
    }

    #[test]
    fn header_rejects_bad_data_len() {
        let mut buf = [0u8; PAGE_SIZE];
        let h = PageHeader {
            version: 1,
            prev: NO_PAGE,
            next: NO_PAGE,
            flags: FLAG_DATA,
            data_len: 0,
        };
        header_write(&mut buf, &h);
        LittleEndian::write_i32(&mut buf[OFF_DATA_LEN..OFF_DATA_LEN + 4], 4062);
        assert!(header_read(5, &buf).is_err());
        LittleEndian::write_i32(&mut buf[OFF_DATA_LEN..OFF_DATA_LEN + 4], -1);
        assert!(header_read(5, &buf).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut p = Page::new(9, FLAG_DATA, 3);
        p.header.prev = 8;
        p.set_data(b"stream bytes");
        let buf = encode(&p);
        assert!(crc_verify(&buf));

        let got = decode(9, &buf).unwrap();
        assert_eq!(got.header, p.header);
        assert_eq!(got.data, p.data);
    }

    #[test]
    fn crc_detects_flip() {
        let mut p = Page::new(4, FLAG_DATA, 1);
        p.set_data(&[0xAB; 100]);
        let mut buf = encode(&p);
        assert!(crc_verify(&buf));
        buf[PAGE_HDR_SIZE + 50] ^= 0x01;
        assert!(!crc_verify(&buf));
    }

    #[test]
    fn full_capacity_page() {
        let mut p = Page::new(4, FLAG_DATA, 1);
        p.set_data(&vec![0x5A; PAGE_DATA_CAPACITY]);
        let buf = encode(&p);
        let got = decode(4, &buf).unwrap();
        assert_eq!(got.data.len(), PAGE_DATA_CAPACITY);
        assert_eq!(got.header.data_len as usize, PAGE_DATA_CAPACITY);
    }
}
