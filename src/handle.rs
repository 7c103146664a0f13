//! The file handle and archive engine — the entry point for every public
//! operation. Owns exactly one backend and the cached archive-descriptor
//! table; both are released on `close` (and, if the caller forgets, by the
//! `Drop` impl at the bottom of this file).

use crate::archive::{dump_archive, parse_archives, ArchiveDescriptor, ArchiveSpec, ARCHIVE_SIZE};
use crate::backend::file::FileBackend;
#[cfg(unix)]
use crate::backend::mmap::MmapBackend;
use crate::backend::Backend;
use crate::error::{Result, WhisperError};
use crate::metadata::{dump_metadata, parse_metadata, Aggregation, Metadata, METADATA_SIZE};
use crate::point::{dump_point, parse_points, Point, POINT_SIZE};
use crate::time;
use std::fs::OpenOptions;
use std::path::Path;

/// Which backend `open`/`create` should use. `File` is always available;
/// `Mmap` only on unix, matching `backend::mmap`'s `#[cfg(unix)]` gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    File,
    #[cfg(unix)]
    Mmap,
}

pub struct WhisperHandle {
    backend: Box<dyn Backend>,
    metadata: Metadata,
    archives: Vec<ArchiveDescriptor>,
}

fn make_backend(mapping: Mapping) -> Box<dyn Backend> {
    match mapping {
        Mapping::File => Box::new(FileBackend::new()),
        #[cfg(unix)]
        Mapping::Mmap => Box::new(MmapBackend::new()),
    }
}

/// `((timestamp - base) / spp) mod points_count`, done in `i64` so that a
/// `timestamp` older than `base` (legitimate for wrap-around range queries)
/// never underflows the unsigned subtraction the reference's addressing
/// math would otherwise perform.
fn slot_for(base: u32, timestamp: u32, spp: u32, points_count: u32) -> usize {
    let delta = timestamp as i64 - base as i64;
    delta.div_euclid(spp as i64).rem_euclid(points_count as i64) as usize
}

fn validate_archives(metadata: &Metadata, archives: &[ArchiveDescriptor]) -> Result<()> {
    if archives.is_empty() || archives.len() != metadata.archives_count as usize {
        return Err(WhisperError::Archive { reason: "archive count mismatch".into() });
    }

    let mut expected_offset = METADATA_SIZE as u32 + ARCHIVE_SIZE as u32 * archives.len() as u32;
    for (i, a) in archives.iter().enumerate() {
        if a.seconds_per_point == 0 || a.points_count == 0 {
            return Err(WhisperError::Archive { reason: format!("archive {i} has a zero spp or points_count") });
        }
        if a.offset != expected_offset {
            return Err(WhisperError::ArchiveMisaligned {
                reason: format!("archive {i} offset {} does not follow its predecessor (expected {expected_offset})", a.offset),
            });
        }
        if i > 0 {
            let prev = archives[i - 1];
            if a.seconds_per_point <= prev.seconds_per_point {
                return Err(WhisperError::Archive { reason: format!("archive {i} does not have a strictly larger spp than archive {}", i - 1) });
            }
            if a.seconds_per_point % prev.seconds_per_point != 0 {
                return Err(WhisperError::ArchiveMisaligned { reason: format!("archive {i} spp is not an integer multiple of archive {}", i - 1) });
            }
        }
        expected_offset += a.points_size() as u32;
    }

    let max_retention = archives.last().unwrap().retention();
    if max_retention != metadata.max_retention as u64 {
        return Err(WhisperError::Archive {
            reason: format!("metadata max_retention {} does not match largest archive retention {max_retention}", metadata.max_retention),
        });
    }
    if !(0.0..=1.0).contains(&metadata.x_files_factor) {
        return Err(WhisperError::Archive { reason: "x_files_factor out of [0.0, 1.0]".into() });
    }
    Ok(())
}

impl WhisperHandle {
    /// Open an existing, well-formed whisper file. Validates every §3
    /// invariant before returning — a handle never exists over a file whose
    /// archive table does not check out.
    pub fn open(path: &Path, mapping: Mapping) -> Result<Self> {
        let mut backend = make_backend(mapping);
        backend.open(path)?;

        let metadata = match backend.read(0, METADATA_SIZE).map(|buf| parse_metadata(&buf)) {
            Ok(Ok(m)) => m,
            Ok(Err(e)) | Err(e) => {
                let _ = backend.close();
                return Err(e);
            }
        };

        let table_size = metadata.archives_count as usize * ARCHIVE_SIZE;
        let archives = match backend.read(METADATA_SIZE as u64, table_size) {
            Ok(buf) => parse_archives(&buf, metadata.archives_count as usize),
            Err(e) => {
                let _ = backend.close();
                return Err(e);
            }
        };

        if let Err(e) = validate_archives(&metadata, &archives) {
            let _ = backend.close();
            return Err(e);
        }

        Ok(Self { backend, metadata, archives })
    }

    /// Lay out a brand-new file — metadata, archive table, zeroed bodies —
    /// then reopen it through [`WhisperHandle::open`], so `create` can never
    /// drift from what `open` itself would accept.
    pub fn create(path: &Path, mapping: Mapping, archives: &[ArchiveSpec], aggregation: Aggregation, x_files_factor: f32) -> Result<Self> {
        if archives.is_empty() {
            return Err(WhisperError::Archive { reason: "at least one archive is required".into() });
        }
        for w in archives.windows(2) {
            if w[1].seconds_per_point <= w[0].seconds_per_point {
                return Err(WhisperError::Archive { reason: "archives must have strictly ascending seconds_per_point".into() });
            }
            if w[1].seconds_per_point % w[0].seconds_per_point != 0 {
                return Err(WhisperError::ArchiveMisaligned {
                    reason: "each archive's interval must be an integer multiple of the previous one's".into(),
                });
            }
        }
        if !(0.0..=1.0).contains(&x_files_factor) {
            return Err(WhisperError::Archive { reason: "x_files_factor out of [0.0, 1.0]".into() });
        }

        let mut offset = METADATA_SIZE as u32 + ARCHIVE_SIZE as u32 * archives.len() as u32;
        let mut descriptors = Vec::with_capacity(archives.len());
        for spec in archives {
            descriptors.push(ArchiveDescriptor { offset, seconds_per_point: spec.seconds_per_point, points_count: spec.points_count });
            offset += spec.points_count * POINT_SIZE as u32;
        }
        let max_retention = descriptors.last().unwrap().retention() as u32;
        let metadata = Metadata { aggregation, max_retention, x_files_factor, archives_count: descriptors.len() as u32 };

        {
            let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
            file.set_len(offset as u64)?;
        }

        let mut backend = make_backend(mapping);
        backend.open(path)?;

        let mut meta_buf = [0u8; METADATA_SIZE];
        dump_metadata(&metadata, &mut meta_buf);
        backend.write(0, &meta_buf)?;

        let mut table_buf = vec![0u8; archives.len() * ARCHIVE_SIZE];
        for (i, d) in descriptors.iter().enumerate() {
            dump_archive(d, &mut table_buf[i * ARCHIVE_SIZE..(i + 1) * ARCHIVE_SIZE]);
        }
        backend.write(METADATA_SIZE as u64, &table_buf)?;

        for d in &descriptors {
            let zeros = vec![0u8; d.points_size()];
            backend.write(d.offset as u64, &zeros)?;
        }
        backend.close()?;

        Self::open(path, mapping)
    }

    /// Release the backend and cached descriptors. Idempotent: calling it
    /// twice, or letting `Drop` call it after an explicit `close`, is safe
    /// because the underlying backends' own `close` methods are idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn archives(&self) -> &[ArchiveDescriptor] {
        &self.archives
    }

    fn archive(&self, index: usize) -> Result<ArchiveDescriptor> {
        self.archives.get(index).copied().ok_or(WhisperError::Archive { reason: format!("no archive at index {index}") })
    }

    fn base_timestamp(&mut self, archive_index: usize) -> Result<u32> {
        Ok(self.load_point(archive_index, 0)?.timestamp)
    }

    pub fn load_point(&mut self, archive_index: usize, slot_index: usize) -> Result<Point> {
        let archive = self.archive(archive_index)?;
        if slot_index >= archive.points_count as usize {
            return Err(WhisperError::PointOutOfBounds { index: slot_index as u32, count: archive.points_count });
        }
        let offset = archive.offset as u64 + (slot_index * POINT_SIZE) as u64;
        let buf = self.backend.read(offset, POINT_SIZE)?;
        Ok(crate::point::parse_point(&buf))
    }

    /// Read `count` consecutive slots starting at `slot_offset`, wrapping
    /// around the ring with two reads when the run crosses the end.
    pub fn load_points(&mut self, archive_index: usize, slot_offset: usize, count: usize) -> Result<Vec<Point>> {
        let archive = self.archive(archive_index)?;
        let n = archive.points_count as usize;
        if count > n {
            return Err(WhisperError::PointOutOfBounds { index: count as u32, count: archive.points_count });
        }
        let start = slot_offset % n;
        let end = start + count;

        if end <= n {
            let buf = self.backend.read(archive.offset as u64 + (start * POINT_SIZE) as u64, count * POINT_SIZE)?;
            Ok(parse_points(&buf, count))
        } else {
            let first_count = n - start;
            let second_count = end - n;
            let first = self.backend.read(archive.offset as u64 + (start * POINT_SIZE) as u64, first_count * POINT_SIZE)?;
            let mut points = parse_points(&first, first_count);
            drop(first);
            let second = self.backend.read(archive.offset as u64, second_count * POINT_SIZE)?;
            points.extend(parse_points(&second, second_count));
            Ok(points)
        }
    }

    pub fn load_all_points(&mut self, archive_index: usize) -> Result<Vec<Point>> {
        let count = self.archive(archive_index)?.points_count as usize;
        self.load_points(archive_index, 0, count)
    }

    /// Points in `[t_from, t_until)`, clamped to the archive's retention
    /// window and wrapped around the ring as needed. Returns an empty
    /// sequence for an archive that has never been written.
    pub fn load_time_range(&mut self, archive_index: usize, t_from: u32, t_until: u32) -> Result<Vec<Point>> {
        if t_from >= t_until {
            return Err(WhisperError::TimeInterval);
        }
        let archive = self.archive(archive_index)?;
        let now = time::now();
        let oldest = now.saturating_sub(archive.retention() as u32);
        let t_from = t_from.max(oldest);

        let base = self.base_timestamp(archive_index)?;
        if base == 0 {
            return Ok(Vec::new());
        }

        let n = archive.points_count;
        let slot_from = slot_for(base, t_from, archive.seconds_per_point, n);
        let slot_until = slot_for(base, t_until, archive.seconds_per_point, n);

        if slot_until > slot_from {
            self.load_points(archive_index, slot_from, slot_until - slot_from)
        } else {
            let n = n as usize;
            let mut points = self.load_points(archive_index, slot_from, n - slot_from)?;
            if slot_until > 0 {
                points.extend(self.load_points(archive_index, 0, slot_until)?);
            }
            Ok(points)
        }
    }

    fn write_point_into(&mut self, archive_index: usize, timestamp: u32, value: f64) -> Result<()> {
        let archive = self.archive(archive_index)?;
        let ts = time::floor(timestamp, archive.seconds_per_point);
        let base = self.base_timestamp(archive_index)?;
        let slot = if base == 0 { 0 } else { slot_for(base, ts, archive.seconds_per_point, archive.points_count) };

        let mut buf = [0u8; POINT_SIZE];
        dump_point(&Point { timestamp: ts, value }, &mut buf);
        let offset = archive.offset as u64 + (slot * POINT_SIZE) as u64;
        self.backend.write(offset, &buf)
    }

    /// Walk from `fine_index` to successively coarser archives, aggregating
    /// the window of finer points covering each coarse slot and writing it
    /// when the known/expected ratio meets the configured x-files-factor.
    /// Stops — does not error — the first time the threshold is missed.
    fn propagate(&mut self, mut fine_index: usize, mut timestamp: u32) -> Result<()> {
        let aggregation = self.metadata.aggregation;
        let xff = self.metadata.x_files_factor;

        while fine_index + 1 < self.archives.len() {
            let coarse_index = fine_index + 1;
            let fine = self.archive(fine_index)?;
            let coarse = self.archive(coarse_index)?;
            let coarse_ts = time::floor(timestamp, coarse.seconds_per_point);
            let expected_count = (coarse.seconds_per_point / fine.seconds_per_point) as usize;

            let fine_base = self.base_timestamp(fine_index)?;
            if fine_base == 0 {
                break;
            }
            let fine_slot_start = slot_for(fine_base, coarse_ts, fine.seconds_per_point, fine.points_count);
            let fine_points = self.load_points(fine_index, fine_slot_start, expected_count)?;

            let known: Vec<f64> = fine_points
                .iter()
                .enumerate()
                .filter(|(i, p)| !p.is_empty() && p.timestamp == coarse_ts + (*i as u32) * fine.seconds_per_point)
                .map(|(_, p)| p.value)
                .collect();

            if known.len() as f32 / expected_count as f32 + f32::EPSILON < xff {
                break;
            }

            let aggregate = aggregation.aggregate(&known);
            self.write_point_into(coarse_index, coarse_ts, aggregate)?;

            fine_index = coarse_index;
            timestamp = coarse_ts;
        }
        Ok(())
    }

    /// Apply one observation: floor to the finest archive's resolution,
    /// reject it if it is in the future or older than the file's overall
    /// retention, write it into the highest-resolution archive that covers
    /// its age, then propagate the aggregate downward through coarser ones.
    pub fn update(&mut self, timestamp: u32, value: f64) -> Result<()> {
        let finest = self.archive(0)?;
        let floored = time::floor(timestamp, finest.seconds_per_point);
        let now = time::now();

        if floored > now {
            return Err(WhisperError::FutureTimestamp);
        }
        let age = (now - floored) as u64;
        if age > self.metadata.max_retention as u64 {
            return Err(WhisperError::Retention);
        }

        let archive_index = self
            .archives
            .iter()
            .position(|a| a.retention() >= age)
            .ok_or(WhisperError::Retention)?;

        self.write_point_into(archive_index, floored, value)?;
        self.propagate(archive_index, floored)
    }
}

impl Drop for WhisperHandle {
    fn drop(&mut self) {
        let _ = self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn two_archive_specs() -> [ArchiveSpec; 2] {
        [
            ArchiveSpec { seconds_per_point: 60, points_count: 10 },
            ArchiveSpec { seconds_per_point: 300, points_count: 5 },
        ]
    }

    #[test]
    fn create_lays_out_validated_archives() {
        let tmp = NamedTempFile::new().unwrap();
        let handle = WhisperHandle::create(tmp.path(), Mapping::File, &two_archive_specs(), Aggregation::Average, 0.5).unwrap();
        assert_eq!(handle.archives().len(), 2);
        assert_eq!(handle.metadata().max_retention, 1500);
        assert_eq!(handle.archives()[0].offset, METADATA_SIZE as u32 + ARCHIVE_SIZE as u32 * 2);
    }

    #[test]
    fn create_rejects_descending_resolution() {
        let tmp = NamedTempFile::new().unwrap();
        let specs = [
            ArchiveSpec { seconds_per_point: 300, points_count: 5 },
            ArchiveSpec { seconds_per_point: 60, points_count: 10 },
        ];
        let err = WhisperHandle::create(tmp.path(), Mapping::File, &specs, Aggregation::Average, 0.5).unwrap_err();
        assert!(matches!(err, WhisperError::Archive { .. }));
    }

    #[test]
    fn single_archive_update_writes_expected_slot() {
        let tmp = NamedTempFile::new().unwrap();
        let specs = [ArchiveSpec { seconds_per_point: 60, points_count: 10 }];
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &specs, Aggregation::Average, 0.5).unwrap();

        let now = time::now();
        let ts = time::floor(now - 60, 60);
        handle.update(ts, 1.5).unwrap();

        let p = handle.load_point(0, 0).unwrap();
        assert_eq!(p.timestamp, ts);
        assert_eq!(p.value, 1.5);
    }

    #[test]
    fn propagation_threshold_met_overwrites_and_averages() {
        let tmp = NamedTempFile::new().unwrap();
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &two_archive_specs(), Aggregation::Average, 0.5).unwrap();

        let now = time::now();
        let base = time::floor(now - 900, 300);

        for (i, v) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
            handle.update(base + i as u32 * 60, v).unwrap();
        }
        // Replaces the same ring slot as the fifth sample rather than adding a sixth.
        handle.update(base + 4 * 60, 6.0).unwrap();

        let coarse = handle.load_point(1, 0).unwrap();
        assert_eq!(coarse.timestamp, base);
        assert!((coarse.value - 4.0).abs() < 1e-9);
    }

    #[test]
    fn propagation_threshold_not_met_leaves_coarse_archive_untouched() {
        let tmp = NamedTempFile::new().unwrap();
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &two_archive_specs(), Aggregation::Average, 0.5).unwrap();

        let now = time::now();
        let base = time::floor(now - 900, 300);
        handle.update(base, 1.0).unwrap();

        let coarse = handle.load_point(1, 0).unwrap();
        assert!(coarse.is_empty());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let specs = [ArchiveSpec { seconds_per_point: 60, points_count: 10 }];
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &specs, Aggregation::Average, 0.5).unwrap();

        let err = handle.update(time::now() + 10_000, 1.0).unwrap_err();
        assert!(matches!(err, WhisperError::FutureTimestamp));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let specs = [ArchiveSpec { seconds_per_point: 60, points_count: 10 }];
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &specs, Aggregation::Average, 0.5).unwrap();

        let err = handle.update(100, 1.0).unwrap_err();
        assert!(matches!(err, WhisperError::Retention));
    }

    #[test]
    fn range_query_wraps_around_the_ring() {
        let tmp = NamedTempFile::new().unwrap();
        let specs = [ArchiveSpec { seconds_per_point: 60, points_count: 10 }];
        let mut handle = WhisperHandle::create(tmp.path(), Mapping::File, &specs, Aggregation::Average, 0.5).unwrap();

        let now = time::now();
        let base = time::floor(now - 540, 60);
        for i in 0..9u32 {
            handle.update(base + i * 60, i as f64).unwrap();
        }

        let points = handle.load_time_range(0, base + 7 * 60, base + 9 * 60).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, base + 7 * 60);
        assert_eq!(points[1].timestamp, base + 8 * 60);
    }

    /// Mirrors `SPEC_FULL.md`'s S5 scenario: a base near the end of the ring
    /// forces `load_time_range` to actually take the wrap branch (two reads,
    /// one up to the end of the ring and one from its start), not just the
    /// single-region path the non-wrapping test above exercises.
    #[test]
    fn range_query_genuinely_wraps_past_the_ring_end() {
        use std::io::{Seek, SeekFrom, Write};

        let tmp = NamedTempFile::new().unwrap();
        let handle = WhisperHandle::create(tmp.path(), Mapping::File, &[ArchiveSpec { seconds_per_point: 60, points_count: 10 }], Aggregation::Average, 0.5).unwrap();
        drop(handle);

        let now = time::now();
        let base = time::floor(now - 540, 60);
        let archive_offset = METADATA_SIZE as u64 + ARCHIVE_SIZE as u64;

        // Write slot 0 (the base) and slot 9 directly, bypassing `update`'s
        // own slot derivation, so the ring is primed without having to
        // replay nine sequential updates to get there.
        let mut file = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
        let mut buf = [0u8; POINT_SIZE];
        dump_point(&Point { timestamp: base, value: 0.0 }, &mut buf);
        file.seek(SeekFrom::Start(archive_offset)).unwrap();
        file.write_all(&buf).unwrap();
        dump_point(&Point { timestamp: base + 9 * 60, value: 9.0 }, &mut buf);
        file.seek(SeekFrom::Start(archive_offset + 9 * POINT_SIZE as u64)).unwrap();
        file.write_all(&buf).unwrap();
        drop(file);

        let mut handle = WhisperHandle::open(tmp.path(), Mapping::File).unwrap();
        // slot_from = 9, slot_until = 1: slot_until <= slot_from, so this
        // must wrap — one read for slot 9, one for slot 0.
        let points = handle.load_time_range(0, base + 9 * 60, base + 11 * 60).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, base + 9 * 60);
        assert_eq!(points[1].timestamp, base);
    }
}
