//! Crash safety: порча магии, порванные ротации, усечение файла,
//! пересборка free-list, подбор orphan-страниц.

use std::fs::{self, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::Rng;

use streamdb::consts::{FREE_OFF_IDS, PAGE_HDR_SIZE, PAGE_SIZE};
use streamdb::header::DbHeader;
use streamdb::medium::FileMedium;
use streamdb::store::PageStore;
use streamdb::{metrics_snapshot, Config, StreamDb, StreamDbError};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("sdb-rec-{}-{}-{}", prefix, pid, t));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn tight_config() -> Config {
    Config::default().with_grow_batch_pages(1)
}

fn flip_byte(path: &Path, offset: u64) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&[b[0] ^ 0xFF]).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn altered_magic_fails_open() -> Result<()> {
    let file = unique_root("magic").join("db.sdb");
    {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/x", &mut Cursor::new(b"data".to_vec()))?;
        db.flush()?;
    }
    // Любой из восьми байт магии.
    flip_byte(&file, rand::thread_rng().gen_range(0..8));
    match StreamDb::open_with_config(&file, tight_config()) {
        Err(StreamDbError::BadMagic) => Ok(()),
        other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
    }
}

/// Эмуляция обрыва между флашем новых цепочек и флашем ротации корня:
/// восстанавливаем страницу-заголовок в состояние до второй записи.
/// Старый документ обязан читаться, страницы новой цепочки — уйти в
/// free-list при восстановлении.
#[test]
fn torn_rotation_falls_back_and_reclaims_new_chain() -> Result<()> {
    let file = unique_root("torn").join("db.sdb");

    {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/a", &mut Cursor::new(b"AAAA".to_vec()))?;
        db.flush()?;
    }
    let old_header: Vec<u8> = fs::read(&file)?[..PAGE_SIZE].to_vec();

    {
        let db = StreamDb::open_with_config(&file, tight_config())?;
        db.write_document("/a", &mut Cursor::new(b"BBBB".to_vec()))?;
        db.flush()?;
    }

    // «Обрыв»: данные второй записи на диске, заголовок — нет.
    {
        let mut f = OpenOptions::new().write(true).open(&file)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&old_header)?;
        f.sync_all()?;
    }

    let db = StreamDb::open_with_config(&file, tight_config())?;
    assert_eq!(db.get("/a")?.expect("old version readable"), b"AAAA");
    // Цепочка B и таблица второй версии недостижимы — подобраны sweep-ом.
    let stats = db.statistics()?;
    assert_eq!(stats.free_pages, 2);
    assert_eq!(stats.total_pages, 9);

    // БД полностью работоспособна дальше.
    db.write_document("/a", &mut Cursor::new(b"CCCC".to_vec()))?;
    assert_eq!(db.get("/a")?.expect("present"), b"CCCC");
    Ok(())
}

/// Усечение файла позади последней ротации: current-слот указывает за
/// EOF, открытие откатывается на prior.
#[test]
fn truncated_tail_falls_back_to_prior() -> Result<()> {
    let file = unique_root("trunc").join("db.sdb");

    {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/a", &mut Cursor::new(b"AAAA".to_vec()))?;
        db.flush()?;
    }
    let len_after_first = fs::metadata(&file)?.len();

    {
        let db = StreamDb::open_with_config(&file, tight_config())?;
        db.write_document("/a", &mut Cursor::new(b"BBBB".to_vec()))?;
        db.flush()?;
    }

    let f = OpenOptions::new().write(true).open(&file)?;
    f.set_len(len_after_first)?;
    f.sync_all()?;

    let db = StreamDb::open_with_config(&file, tight_config())?;
    assert_eq!(db.get("/a")?.expect("prior version readable"), b"AAAA");
    assert_eq!(db.statistics()?.total_pages as u64, len_after_first / PAGE_SIZE as u64);
    Ok(())
}

#[test]
fn corrupt_freelist_page_triggers_scan_rebuild() -> Result<()> {
    let file = unique_root("flrebuild").join("db.sdb");

    let free_before = {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/a", &mut Cursor::new(vec![1u8; 100]))?;
        db.write_document("/b", &mut Cursor::new(vec![2u8; 100]))?;
        // Перезаписи дают освобождения после окна удержания.
        for i in 0..4 {
            db.write_document("/a", &mut Cursor::new(vec![i as u8; 100]))?;
        }
        db.flush()?;
        db.statistics()?.free_pages
    };
    assert!(free_before > 0, "test needs a non-empty free list");

    // Находим корень free-list и портим контейнер.
    let free_root = {
        let store = PageStore::new(Box::new(FileMedium::open(&file)?), 0);
        let hdr = DbHeader::read(&store)?;
        hdr.free_root.current.page_id
    };
    assert!(free_root > 0);
    // CRC покрывает [4..4096] — бьём случайный байт области записей.
    let off = rand::thread_rng().gen_range(FREE_OFF_IDS..PAGE_SIZE) as u64;
    flip_byte(&file, free_root as u64 * PAGE_SIZE as u64 + off);

    let rebuilds_before = metrics_snapshot().freelist_rebuilds;
    let db = StreamDb::open_with_config(&file, tight_config())?;
    assert!(metrics_snapshot().freelist_rebuilds > rebuilds_before);

    // Скан восстановил тот же объём свободного места, данные целы.
    assert_eq!(db.statistics()?.free_pages, free_before);
    assert_eq!(db.get("/a")?.expect("present"), vec![3u8; 100]);
    assert_eq!(db.get("/b")?.expect("present"), vec![2u8; 100]);

    // Аллокатор работает поверх пересобранного списка.
    db.write_document("/c", &mut Cursor::new(vec![7u8; 100]))?;
    assert_eq!(db.get("/c")?.expect("present"), vec![7u8; 100]);
    Ok(())
}

#[test]
fn appended_garbage_page_is_swept_to_free_list() -> Result<()> {
    let file = unique_root("orphan").join("db.sdb");

    {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/keep", &mut Cursor::new(b"kept".to_vec()))?;
        db.flush()?;
    }
    {
        let mut f = OpenOptions::new().append(true).open(&file)?;
        f.write_all(&[0xDEu8; PAGE_SIZE])?;
        f.sync_all()?;
    }

    let db = StreamDb::open_with_config(&file, tight_config())?;
    assert_eq!(db.statistics()?.free_pages, 1);
    assert_eq!(db.get("/keep")?.expect("present"), b"kept");
    Ok(())
}

/// Порча страницы данных: чтение этого документа падает ошибкой,
/// отличимой от not-found; остальные документы читаются.
#[test]
fn corrupt_document_page_surfaces_error_not_notfound() -> Result<()> {
    let file = unique_root("corruptdoc").join("db.sdb");

    {
        let db = StreamDb::create_with_config(&file, tight_config())?;
        db.write_document("/bad", &mut Cursor::new(vec![9u8; 100]))?;
        db.write_document("/good", &mut Cursor::new(b"fine".to_vec()))?;
        db.flush()?;
    }

    // Первая контентная страница — цепочка /bad (первая запись).
    let bad_chain_page = {
        let store = PageStore::new(Box::new(FileMedium::open(&file)?), 0);
        let hdr = DbHeader::read(&store)?;
        let table = streamdb::index::DocIndex::deserialize(&streamdb::chain::read_chain(
            &store,
            hdr.index_root.current.page_id,
            true,
        )?)?;
        let mut pages: Vec<i32> = table.iter().map(|(_, e)| e.first_page).collect();
        pages.sort();
        pages[0]
    };
    // Случайный байт payload-области: заголовок цел, CRC ломается.
    let off = rand::thread_rng().gen_range(PAGE_HDR_SIZE..PAGE_SIZE) as u64;
    flip_byte(&file, bad_chain_page as u64 * PAGE_SIZE as u64 + off);

    let db = StreamDb::open_with_config(&file, tight_config())?;
    let err = db.get("/bad");
    assert!(
        matches!(err, Err(ref e) if e.is_corruption()),
        "corrupt chain must be an error distinct from not-found: {:?}",
        err.map(|_| ())
    );
    // Остальные чтения живы.
    assert_eq!(db.get("/good")?.expect("present"), b"fine");
    Ok(())
}
