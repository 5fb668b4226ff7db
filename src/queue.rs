use std::fs;
use std::path::PathBuf;

use std::os::unix::fs::{MetadataExt, PermissionsExt};

use tracing::{debug, warn};

use crate::product::{Product, ProductTable};
use crate::record::ProductLog;
use crate::{fsutil, now_epoch, Error};

/// Zero-byte files younger than this are assumed to still be written.
pub const ZERO_AGE_GRACE: u64 = 3;

/// A scanned file waiting to become a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub filename: PathBuf,
    /// File mtime, epoch seconds.
    pub queue_time: u64,
    pub size: u64,
    pub priority: u32,
}

/// Priority/age-ordered view over the configured input directories.
pub struct DirQueue {
    dirs: Vec<PathBuf>,
    refresh_interval: u64,
    max_queue_len: usize,
    wait_last_file: bool,
    list: Vec<Candidate>,
    cursor: usize,
    last_scan: u64,
}

impl DirQueue {
    pub fn new(
        dirs: Vec<PathBuf>,
        refresh_interval: u64,
        max_queue_len: usize,
        wait_last_file: bool,
    ) -> Self {
        DirQueue {
            dirs,
            refresh_interval,
            max_queue_len,
            wait_last_file,
            list: Vec::new(),
            cursor: 0,
            last_scan: 0,
        }
    }

    /// Produce the next candidate, rescanning the directories when the
    /// current list is exhausted or the refresh interval elapsed. The
    /// returned length counts the remaining candidates including the one
    /// returned.
    pub fn next(&mut self, table: &ProductTable) -> (usize, Option<Candidate>) {
        let now = now_epoch();

        if self.cursor >= self.list.len()
            || (self.refresh_interval > 0 && now >= self.last_scan + self.refresh_interval)
        {
            self.rescan(table, now);
        }

        if self.cursor >= self.list.len() {
            return (0, None);
        }

        let remaining = self.list.len() - self.cursor;

        if self.wait_last_file {
            // Hold the newest file back until something newer shows up; a
            // writer may still be appending to it.
            let newest = self
                .list
                .iter()
                .map(|c| c.queue_time)
                .max()
                .unwrap_or(0);
            if self.list[self.cursor].queue_time == newest {
                return (remaining, None);
            }
        }

        let cand = self.list[self.cursor].clone();
        self.cursor += 1;
        (remaining, Some(cand))
    }

    fn rescan(&mut self, table: &ProductTable, now: u64) {
        self.list.clear();
        self.cursor = 0;
        self.last_scan = now;

        'scan: for (di, dir) in self.dirs.iter().enumerate() {
            let priority = (self.dirs.len() - 1 - di) as u32;
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot scan {}: {e}", dir.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();

                // stat() through symlinks; anything but a regular file is
                // not a product.
                let md = match fs::metadata(&path) {
                    Ok(md) => md,
                    Err(_) => continue,
                };
                if !md.is_file() {
                    continue;
                }
                if md.permissions().mode() & 0o444 == 0 {
                    continue;
                }

                let mtime = md.mtime().max(0) as u64;
                if md.len() == 0 && mtime + ZERO_AGE_GRACE > now {
                    continue;
                }
                if table.in_flight(&path) {
                    continue;
                }

                self.list.push(Candidate {
                    filename: path,
                    queue_time: mtime,
                    size: md.len(),
                    priority,
                });
                if self.list.len() >= self.max_queue_len {
                    debug!("scan stopped at the {}-candidate bound", self.max_queue_len);
                    break 'scan;
                }
            }
        }

        self.list
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.queue_time.cmp(&b.queue_time)));
    }
}

/// Rotating sent/fail areas. Successfully acknowledged products rotate
/// through `sent_dir/NNN`, aborted ones through `fail_dir` with the same
/// modulus, bounding the disk both can consume.
pub struct SentArea {
    sent_dir: PathBuf,
    fail_dir: PathBuf,
    count: u32,
    width: usize,
    sent_idx: u32,
    fail_idx: u32,
}

impl SentArea {
    pub fn new(sent_dir: PathBuf, fail_dir: PathBuf, count: u32) -> Self {
        assert!(count >= 1, "rotation size must be positive");
        let width = format!("{}", count - 1).len();
        SentArea {
            sent_dir,
            fail_dir,
            count,
            width,
            sent_idx: 0,
            fail_idx: 0,
        }
    }

    /// Move an acknowledged product into the next sent slot.
    pub fn finish(&mut self, prod: &Product, log: &mut ProductLog) -> Result<(), Error> {
        let dst = self
            .sent_dir
            .join(format!("{:0w$}", self.sent_idx, w = self.width));
        fsutil::rename_or_copy(&prod.filename, &dst)?;
        self.sent_idx = (self.sent_idx + 1) % self.count;

        log.record(
            "END",
            format_args!(
                "{:05} {} {} bytes in {} send(s)",
                prod.seqno,
                prod.filename.display(),
                prod.size,
                prod.send_count
            ),
        );
        Ok(())
    }

    /// Move a failed product into the next fail slot.
    pub fn abort(&mut self, prod: &Product, reason: &str, log: &mut ProductLog) -> Result<(), Error> {
        let dst = self
            .fail_dir
            .join(format!("{:0w$}", self.fail_idx, w = self.width));
        fsutil::rename_or_copy(&prod.filename, &dst)?;
        self.fail_idx = (self.fail_idx + 1) % self.count;

        log.record(
            &format!("ABORT({reason})"),
            format_args!("{:05} {}", prod.seqno, prod.filename.display()),
        );
        Ok(())
    }

    /// A retransmission request leaves the file where it is; only observe it.
    pub fn retry(&self, prod: &Product, log: &mut ProductLog) {
        log.record(
            &format!("RETRY[{}]", prod.send_count),
            format_args!("{:05} {}", prod.seqno, prod.filename.display()),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::thread::sleep;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::product::ProductState;

    fn queue_for(dir: &Path) -> DirQueue {
        DirQueue::new(vec![dir.to_owned()], 0, 1024, false)
    }

    #[test]
    fn plain_file_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prod"), b"data").unwrap();

        let table = ProductTable::new(2);
        let mut queue = queue_for(dir.path());
        let (len, cand) = queue.next(&table);

        assert_eq!(len, 1);
        let cand = cand.unwrap();
        assert_eq!(cand.filename, dir.path().join("prod"));
        assert_eq!(cand.size, 4);
    }

    #[test]
    fn dot_files_never_selected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"data").unwrap();

        let table = ProductTable::new(2);
        let mut queue = queue_for(dir.path());
        assert_eq!(queue.next(&table), (0, None));
    }

    #[test]
    fn young_empty_file_held_until_grace_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();

        let table = ProductTable::new(2);
        let mut queue = queue_for(dir.path());
        assert_eq!(queue.next(&table), (0, None));

        sleep(Duration::from_millis(3100));
        let (_, cand) = queue.next(&table);
        assert_eq!(cand.unwrap().filename, dir.path().join("empty"));
    }

    #[test]
    fn in_flight_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prod");
        fs::write(&path, b"data").unwrap();

        let mut table = ProductTable::new(2);
        let idx = table.take_free().unwrap();
        table.slot_mut(idx).filename = path;
        table.slot_mut(idx).state = ProductState::Queued;
        table.push_retr(idx);

        let mut queue = queue_for(dir.path());
        assert_eq!(queue.next(&table), (0, None));
    }

    #[test]
    fn earlier_directories_win() {
        let high = tempfile::tempdir().unwrap();
        let low = tempfile::tempdir().unwrap();
        fs::write(low.path().join("late"), b"l").unwrap();
        fs::write(high.path().join("urgent"), b"u").unwrap();

        let table = ProductTable::new(2);
        let mut queue = DirQueue::new(
            vec![high.path().to_owned(), low.path().to_owned()],
            0,
            1024,
            false,
        );

        let (len, cand) = queue.next(&table);
        assert_eq!(len, 2);
        assert_eq!(cand.unwrap().filename, high.path().join("urgent"));
        let (len, cand) = queue.next(&table);
        assert_eq!(len, 1);
        assert_eq!(cand.unwrap().filename, low.path().join("late"));
    }

    #[test]
    fn scan_stops_at_bound() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("p{i}")), b"data").unwrap();
        }

        let table = ProductTable::new(2);
        let mut queue = DirQueue::new(vec![dir.path().to_owned()], 0, 3, false);
        let (len, cand) = queue.next(&table);
        assert_eq!(len, 3);
        assert!(cand.is_some());
    }

    #[test]
    fn last_file_held_back_until_a_newer_one_appears() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("older");
        fs::write(&older, b"one").unwrap();

        let table = ProductTable::new(2);
        let mut queue = DirQueue::new(vec![dir.path().to_owned()], 1, 1024, true);

        let (len, cand) = queue.next(&table);
        assert_eq!((len, cand), (1, None));

        // A strictly newer mtime frees the older file.
        sleep(Duration::from_millis(1100));
        fs::write(dir.path().join("newer"), b"two").unwrap();

        let (len, cand) = queue.next(&table);
        assert_eq!(len, 2);
        assert_eq!(cand.unwrap().filename, older);
    }

    #[test]
    fn sent_rotation_wraps_and_pads() {
        let work = tempfile::tempdir().unwrap();
        let sent = work.path().join("sent");
        let fail = work.path().join("fail");
        let mut area = SentArea::new(sent.clone(), fail, 10);
        let mut log = ProductLog::disabled();

        for i in 0..11u32 {
            let src = work.path().join(format!("prod{i}"));
            fs::write(&src, format!("{i}")).unwrap();
            let prod = Product {
                seqno: i,
                filename: src,
                ..Product::default()
            };
            area.finish(&prod, &mut log).unwrap();
        }

        // Slot 0 was overwritten by the 11th product.
        assert_eq!(fs::read_to_string(sent.join("0")).unwrap(), "10");
        assert_eq!(fs::read_to_string(sent.join("9")).unwrap(), "9");
    }

    #[test]
    fn abort_uses_fail_area() {
        let work = tempfile::tempdir().unwrap();
        let sent = work.path().join("sent");
        let fail = work.path().join("fail");
        let mut area = SentArea::new(sent, fail.clone(), 100);
        let mut log = ProductLog::disabled();

        let src = work.path().join("prod");
        fs::write(&src, b"bad").unwrap();
        let prod = Product {
            filename: src.clone(),
            ..Product::default()
        };
        area.abort(&prod, "nack", &mut log).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(fail.join("00")).unwrap(), b"bad");
    }
}
