//! Inventory engine: atomic line draws from newline-delimited product files.
//!
//! Concurrency discipline: an in-process mutex per path (cached in a map)
//! serializes local callers cheaply, and an exclusive advisory lock on a
//! sidecar `.lck` file covers the read-rewrite window against other
//! processes. The rewrite itself is a temp-file rename, so a crash can lose
//! a draw but never corrupt the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use fs2::FileExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("products file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("not enough products in {path}: have {available}, need {requested}")]
    NotEnoughProducts {
        path: PathBuf,
        available: usize,
        requested: usize,
    },

    #[error("invalid products file name: {0}")]
    InvalidName(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, InventoryError>;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[А-Яа-яЁёA-Za-z0-9_\- .]+$").unwrap());

static PATH_LOCKS: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    PATH_LOCKS
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> InventoryError + '_ {
    move |source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = path.with_extension("lck");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        file.lock_exclusive().map_err(io_err(&lock_path))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Validates an operator-supplied file name and appends `.txt` when the
/// extension is missing.
pub fn normalize_file_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || !NAME_RE.is_match(name) {
        return Err(InventoryError::InvalidName(name.to_owned()));
    }
    if name.ends_with(".txt") {
        Ok(name.to_owned())
    } else {
        Ok(format!("{name}.txt"))
    }
}

fn read_records(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(InventoryError::FileNotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
    Ok(raw
        .split('\n')
        .filter(|l| !l.trim().is_empty())
        .map(str::to_owned)
        .collect())
}

fn write_records(path: &Path, records: &[String]) -> Result<()> {
    let tmp = path.with_extension("txt.tmp");
    std::fs::write(&tmp, records.join("\n")).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

/// Number of non-empty records. Missing files count as zero.
pub fn count(path: &Path) -> usize {
    let _local = path_lock(path);
    let _guard = _local.lock();
    read_records(path).map(|r| r.len()).unwrap_or(0)
}

/// Draws the first `amount` records and rewrites the file with the rest.
///
/// Fails without modifying the file when fewer than `amount` records are
/// available. Returns the drawn records and the count left behind.
pub fn draw(path: &Path, amount: usize) -> Result<(Vec<String>, usize)> {
    let local = path_lock(path);
    let _guard = local.lock();
    let _file_lock = FileLock::acquire(path)?;

    let records = read_records(path)?;
    if records.len() < amount {
        return Err(InventoryError::NotEnoughProducts {
            path: path.to_path_buf(),
            available: records.len(),
            requested: amount,
        });
    }
    let remainder = &records[amount..];
    write_records(path, remainder)?;
    Ok((records[..amount].to_vec(), remainder.len()))
}

/// Puts records back at the front of the file, so a failed delivery is
/// re-drawn first on retry.
pub fn push_front(path: &Path, records: &[String]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let local = path_lock(path);
    let _guard = local.lock();
    let _file_lock = FileLock::acquire(path)?;

    let mut all: Vec<String> = records.to_vec();
    match read_records(path) {
        Ok(existing) => all.extend(existing),
        Err(InventoryError::FileNotFound(_)) => {}
        Err(e) => return Err(e),
    }
    write_records(path, &all)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(dir: &tempfile::TempDir, lines: &str) -> PathBuf {
        let path = dir.path().join("goods.txt");
        std::fs::write(&path, lines).unwrap();
        path
    }

    #[test]
    fn draw_takes_from_the_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with(&dir, "A\nB\nC\n");
        let (drawn, left) = draw(&path, 2).unwrap();
        assert_eq!(drawn, vec!["A", "B"]);
        assert_eq!(left, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "C");
    }

    #[test]
    fn empty_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with(&dir, "A\n\n\nB\n\n");
        assert_eq!(count(&path), 2);
        let (drawn, left) = draw(&path, 1).unwrap();
        assert_eq!(drawn, vec!["A"]);
        assert_eq!(left, 1);
    }

    #[test]
    fn overdraw_fails_without_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with(&dir, "A\nB\n");
        let err = draw(&path, 3).unwrap_err();
        assert!(matches!(
            err,
            InventoryError::NotEnoughProducts {
                available: 2,
                requested: 3,
                ..
            }
        ));
        assert_eq!(count(&path), 2);
    }

    #[test]
    fn missing_file_fails_draw_but_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert_eq!(count(&path), 0);
        assert!(matches!(
            draw(&path, 1),
            Err(InventoryError::FileNotFound(_))
        ));
    }

    #[test]
    fn push_front_restores_draw_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_with(&dir, "A\nB\nC");
        let before = std::fs::read_to_string(&path).unwrap();
        let (drawn, _) = draw(&path, 2).unwrap();
        push_front(&path, &drawn).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn file_names_are_validated_and_get_txt_extension() {
        assert_eq!(normalize_file_name("wow").unwrap(), "wow.txt");
        assert_eq!(normalize_file_name("ключи стим.txt").unwrap(), "ключи стим.txt");
        assert!(normalize_file_name("../escape").is_err());
        assert!(normalize_file_name("a/b").is_err());
        assert!(normalize_file_name("").is_err());
    }

    #[test]
    fn concurrent_draws_conserve_records() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..100).map(|i| format!("item{i}")).collect();
        let path = file_with(&dir, &lines.join("\n"));

        let path = Arc::new(path);
        let drawn_total = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..8 {
            let path = Arc::clone(&path);
            let drawn_total = Arc::clone(&drawn_total);
            threads.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    if let Ok((drawn, _)) = draw(&path, 2) {
                        drawn_total.fetch_add(drawn.len(), std::sync::atomic::Ordering::SeqCst);
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        let drawn = drawn_total.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(drawn + count(&path), 100);
    }
}
