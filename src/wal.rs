use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one committed batch to [len][bincode][crc32] format.
fn encode_entry(writer: &mut impl Write, batch: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(batch).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One entry is one committed transaction, so a slot and the booking that
///   created it are replayed together or not at all.
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single batch and fsync. The writer task uses
    /// `append_buffered` + `flush_sync` for group commit instead.
    #[cfg(test)]
    pub fn append(&mut self, batch: &[Event]) -> io::Result<()> {
        self.append_buffered(batch)?;
        self.flush_sync()
    }

    /// Append a batch to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the group to durably commit everything buffered.
    pub fn append_buffered(&mut self, batch: &[Event]) -> io::Result<()> {
        encode_entry(&mut self.writer, batch)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted batches to a temp file and fsync.
    pub fn write_compact_file(path: &Path, batches: &[Vec<Event>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for batch in batches {
            encode_entry(&mut writer, batch)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, batches: &[Vec<Event>]) -> io::Result<()> {
        Self::write_compact_file(&self.path, batches)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid batches in commit order.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut batches = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(batch) => batches.push(batch),
                Err(_) => break,
            }
        }

        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    use crate::model::RoomType;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("tabletime_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn room_created() -> Event {
        Event::RoomCreated {
            id: Ulid::new(),
            name: "Table 1".into(),
            room_type: RoomType::Physical,
            capacity: Some(6),
        }
    }

    fn booking_batch(campaign_id: Ulid) -> Vec<Event> {
        let slot_id = Ulid::new();
        vec![
            Event::SlotOpened {
                id: slot_id,
                campaign_id,
                start: 1000,
            },
            Event::BookingConfirmed {
                id: Ulid::new(),
                campaign_id,
                slot_id,
                user_id: Ulid::new(),
                players_count: 2,
                created_at: 10,
            },
        ]
    }

    #[test]
    fn append_and_replay_batches() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let batches = vec![vec![room_created()], booking_batch(Ulid::new())];
        {
            let mut wal = Wal::open(&path).unwrap();
            for b in &batches {
                wal.append(b).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, batches);
        assert_eq!(replayed[1].len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_batch_is_dropped_whole() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let first = vec![room_created()];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&booking_batch(Ulid::new())).unwrap();
        }
        // Chop the last few bytes off the second entry.
        let full = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 3).unwrap();

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![room_created()]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let compacted = vec![vec![room_created()]];
        let later = booking_batch(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&booking_batch(Ulid::new())).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            wal.append(&later).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), later]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let batches: Vec<Vec<Event>> = (0..5).map(|_| vec![room_created()]).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for b in &batches {
                wal.append_buffered(b).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), batches);
        let _ = fs::remove_file(&path);
    }
}
