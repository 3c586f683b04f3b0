//! Local volume storage
//!
//! Each data folder holds up to `max_volumes` volumes. A volume is two files:
//! - `{vid}.dat`: append-only needle records
//! - `{vid}.vif`: JSON sidecar with placement and size limit
//!
//! Needle record format:
//! `[MAGIC:4][NEEDLE_ID:8][FLAGS:1][DATA_LEN:4][DATA:n][CRC32:4]`
//!
//! The CRC covers everything between the magic and the checksum. Overwrites
//! and deletes append a new record; the superseded bytes count as garbage.

use crate::common::{crc32, timestamp_now, Error, ReplicaPlacement, Result};
use crate::coordinator::heartbeat::VolumeSummary;
use crate::coordinator::topology::VolumeId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type NeedleId = u64;

const NEEDLE_MAGIC: [u8; 4] = [0x4E, 0x44, 0x4C, 0x45]; // "NDLE"
const FLAG_DATA: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;
/// magic + needle id + flags + length + crc
const RECORD_OVERHEAD: u64 = 4 + 8 + 1 + 4 + 4;

fn record_len(data_len: usize) -> u64 {
    RECORD_OVERHEAD + data_len as u64
}

fn checksum(needle: NeedleId, flags: u8, data: &[u8]) -> u32 {
    let mut buf = Vec::with_capacity(13 + data.len());
    buf.extend_from_slice(&needle.to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    crc32(&buf)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeInfoFile {
    replica_placement: ReplicaPlacement,
    size_limit: u64,
    created_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct NeedleEntry {
    /// Offset of the record start
    offset: u64,
    data_len: u32,
}

struct Record {
    needle: NeedleId,
    flags: u8,
    data: Vec<u8>,
}

/// Read one record; `Ok(None)` at a clean end of file
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != NEEDLE_MAGIC {
        return Err(Error::Corrupted("invalid needle magic".into()));
    }

    let mut needle = [0u8; 8];
    reader.read_exact(&mut needle)?;
    let mut flags = [0u8; 1];
    reader.read_exact(&mut flags)?;
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut data)?;
    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;

    let needle = u64::from_le_bytes(needle);
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(needle, flags[0], &data);
    if stored != computed {
        return Err(Error::ChecksumMismatch {
            expected: format!("{:08x}", stored),
            actual: format!("{:08x}", computed),
        });
    }

    Ok(Some(Record {
        needle,
        flags: flags[0],
        data,
    }))
}

pub struct Volume {
    id: VolumeId,
    replica_placement: ReplicaPlacement,
    size_limit: u64,
    dat_path: PathBuf,
    file: File,
    index: HashMap<NeedleId, NeedleEntry>,
    size: u64,
    garbage_bytes: u64,
}

impl Volume {
    fn paths(dir: &Path, vid: VolumeId) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{}.dat", vid)),
            dir.join(format!("{}.vif", vid)),
        )
    }

    fn create(
        dir: &Path,
        vid: VolumeId,
        size_limit: u64,
        replica_placement: ReplicaPlacement,
    ) -> Result<Self> {
        let (dat_path, vif_path) = Self::paths(dir, vid);
        let info = VolumeInfoFile {
            replica_placement,
            size_limit,
            created_at: timestamp_now(),
        };
        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        fs::write(&vif_path, json)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dat_path)?;
        file.sync_all()?;

        Ok(Self {
            id: vid,
            replica_placement,
            size_limit,
            dat_path,
            file,
            index: HashMap::new(),
            size: 0,
            garbage_bytes: 0,
        })
    }

    fn load(dir: &Path, vid: VolumeId) -> Result<Self> {
        let (dat_path, vif_path) = Self::paths(dir, vid);
        let info: VolumeInfoFile = serde_json::from_slice(&fs::read(&vif_path)?)
            .map_err(|e| Error::Corrupted(format!("{}: {}", vif_path.display(), e)))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dat_path)?;

        let mut volume = Self {
            id: vid,
            replica_placement: info.replica_placement,
            size_limit: info.size_limit,
            dat_path,
            file,
            index: HashMap::new(),
            size: 0,
            garbage_bytes: 0,
        };
        volume.scan()?;
        Ok(volume)
    }

    /// Rebuild the index; a torn tail is cut off
    fn scan(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(File::open(&self.dat_path)?);
        let mut offset = 0u64;

        loop {
            match read_record(&mut reader) {
                Ok(Some(record)) => {
                    let len = record_len(record.data.len());
                    self.track(record.needle, record.flags, offset, record.data.len() as u32);
                    offset += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "Volume {}: bad record at offset {} ({}), truncating",
                        self.id,
                        offset,
                        e
                    );
                    break;
                }
            }
        }

        if offset != file_len {
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }
        self.size = offset;
        Ok(())
    }

    fn track(&mut self, needle: NeedleId, flags: u8, offset: u64, data_len: u32) {
        let superseded = self.index.remove(&needle);
        if let Some(old) = superseded {
            self.garbage_bytes += record_len(old.data_len as usize);
        }
        match flags {
            FLAG_DATA => {
                self.index.insert(needle, NeedleEntry { offset, data_len });
            }
            _ => {
                self.garbage_bytes += record_len(data_len as usize);
            }
        }
    }

    fn append(&mut self, needle: NeedleId, flags: u8, data: &[u8]) -> Result<()> {
        let len = record_len(data.len());
        if flags == FLAG_DATA && self.size + len > self.size_limit {
            return Err(Error::VolumeFull(self.id));
        }

        let mut buf = Vec::with_capacity(len as usize);
        buf.extend_from_slice(&NEEDLE_MAGIC);
        buf.extend_from_slice(&needle.to_le_bytes());
        buf.push(flags);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&checksum(needle, flags, data).to_le_bytes());

        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        let offset = self.size;
        self.size += len;
        self.track(needle, flags, offset, data.len() as u32);
        Ok(())
    }

    pub fn put(&mut self, needle: NeedleId, data: &[u8]) -> Result<()> {
        self.append(needle, FLAG_DATA, data)
    }

    pub fn get(&self, needle: NeedleId) -> Result<Vec<u8>> {
        let entry = self
            .index
            .get(&needle)
            .ok_or_else(|| Error::NotFound(format!("needle {} in volume {}", needle, self.id)))?;

        let mut file = File::open(&self.dat_path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        match read_record(&mut file)? {
            Some(record) if record.needle == needle && record.flags == FLAG_DATA => Ok(record.data),
            _ => Err(Error::Corrupted(format!(
                "volume {} index points at a foreign record for needle {}",
                self.id, needle
            ))),
        }
    }

    /// Returns false when the needle did not exist
    pub fn delete(&mut self, needle: NeedleId) -> Result<bool> {
        if !self.index.contains_key(&needle) {
            return Ok(false);
        }
        self.append(needle, FLAG_TOMBSTONE, &[])?;
        Ok(true)
    }

    pub fn summary(&self) -> VolumeSummary {
        VolumeSummary {
            id: self.id,
            size: self.size,
            garbage_bytes: self.garbage_bytes,
            replica_placement: self.replica_placement,
        }
    }

    pub fn needle_count(&self) -> usize {
        self.index.len()
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }
}

/// One data folder and its volume budget
#[derive(Debug, Clone)]
pub struct DiskLocation {
    pub dir: PathBuf,
    pub max_volumes: u32,
}

struct Hosted {
    folder: usize,
    volume: Arc<Mutex<Volume>>,
}

/// All volumes of a storage node
pub struct Store {
    locations: Vec<DiskLocation>,
    volumes: RwLock<HashMap<VolumeId, Hosted>>,
}

impl Store {
    /// Open every folder and load the volumes found there
    pub fn open(folders: &[PathBuf], max_volume_counts: &[u32]) -> Result<Self> {
        if folders.len() != max_volume_counts.len() {
            return Err(Error::InvalidConfig(format!(
                "{} folders but {} max volume counts",
                folders.len(),
                max_volume_counts.len()
            )));
        }

        let mut volumes = HashMap::new();
        let mut locations = Vec::with_capacity(folders.len());
        for (folder, (dir, max)) in folders.iter().zip(max_volume_counts).enumerate() {
            fs::create_dir_all(dir)?;
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("vif") {
                    continue;
                }
                let Some(vid) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<VolumeId>().ok())
                else {
                    continue;
                };
                if volumes.contains_key(&vid) {
                    tracing::warn!("Volume {} found twice, ignoring {}", vid, dir.display());
                    continue;
                }
                let volume = Volume::load(dir, vid)?;
                tracing::info!(
                    "Loaded volume {} from {}: {} needles, {} bytes",
                    vid,
                    dir.display(),
                    volume.needle_count(),
                    volume.size
                );
                volumes.insert(
                    vid,
                    Hosted {
                        folder,
                        volume: Arc::new(Mutex::new(volume)),
                    },
                );
            }
            locations.push(DiskLocation {
                dir: dir.clone(),
                max_volumes: *max,
            });
        }

        Ok(Self {
            locations,
            volumes: RwLock::new(volumes),
        })
    }

    pub fn locations(&self) -> &[DiskLocation] {
        &self.locations
    }

    pub fn max_volume_counts(&self) -> Vec<u32> {
        self.locations.iter().map(|l| l.max_volumes).collect()
    }

    fn used_slots(volumes: &HashMap<VolumeId, Hosted>, folder: usize) -> u32 {
        volumes.values().filter(|h| h.folder == folder).count() as u32
    }

    /// Free slots of one folder; never negative
    pub fn current_free_slots(&self, folder: usize) -> u32 {
        let Some(location) = self.locations.get(folder) else {
            return 0;
        };
        location
            .max_volumes
            .saturating_sub(Self::used_slots(&self.volumes.read(), folder))
    }

    /// Advertised capacity: the sum over all folders
    pub fn free_slots(&self) -> u32 {
        (0..self.locations.len())
            .map(|folder| self.current_free_slots(folder))
            .sum()
    }

    pub fn has_volume(&self, vid: VolumeId) -> bool {
        self.volumes.read().contains_key(&vid)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.read().len()
    }

    /// Provision a volume in the folder with the most free slots. Returns
    /// false when the volume already exists.
    pub fn create_volume(
        &self,
        vid: VolumeId,
        size_limit: u64,
        replica_placement: ReplicaPlacement,
    ) -> Result<bool> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&vid) {
            return Ok(false);
        }

        let folder = (0..self.locations.len())
            .map(|i| {
                let free = self.locations[i]
                    .max_volumes
                    .saturating_sub(Self::used_slots(&volumes, i));
                (i, free)
            })
            .filter(|(_, free)| *free > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(i, _)| i)
            .ok_or_else(|| Error::CapacityMismatch {
                node: "local store".into(),
                reason: format!("no free slot for volume {}", vid),
            })?;

        let dir = &self.locations[folder].dir;
        let volume = Volume::create(dir, vid, size_limit, replica_placement)?;
        tracing::info!(
            "Created volume {} ({}) in {}",
            vid,
            replica_placement,
            dir.display()
        );
        volumes.insert(
            vid,
            Hosted {
                folder,
                volume: Arc::new(Mutex::new(volume)),
            },
        );
        Ok(true)
    }

    fn volume(&self, vid: VolumeId) -> Result<Arc<Mutex<Volume>>> {
        self.volumes
            .read()
            .get(&vid)
            .map(|h| h.volume.clone())
            .ok_or(Error::VolumeNotFound(vid))
    }

    pub fn write(&self, vid: VolumeId, needle: NeedleId, data: &[u8]) -> Result<()> {
        self.volume(vid)?.lock().put(needle, data)
    }

    pub fn read(&self, vid: VolumeId, needle: NeedleId) -> Result<Vec<u8>> {
        self.volume(vid)?.lock().get(needle)
    }

    pub fn delete(&self, vid: VolumeId, needle: NeedleId) -> Result<bool> {
        self.volume(vid)?.lock().delete(needle)
    }

    /// Per-volume summaries for the heartbeat, ordered by id
    pub fn volume_summaries(&self) -> Vec<VolumeSummary> {
        let mut out: Vec<VolumeSummary> = self
            .volumes
            .read()
            .values()
            .map(|h| h.volume.lock().summary())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dirs: &[&Path], max: &[u32]) -> Store {
        let folders: Vec<PathBuf> = dirs.iter().map(|d| d.to_path_buf()).collect();
        Store::open(&folders, max).unwrap()
    }

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = open(&[dir.path()], &[3]);
        assert!(store.create_volume(1, 1 << 20, ReplicaPlacement::default()).unwrap());

        store.write(1, 42, b"hello").unwrap();
        assert_eq!(store.read(1, 42).unwrap(), b"hello");

        store.write(1, 42, b"hello again").unwrap();
        assert_eq!(store.read(1, 42).unwrap(), b"hello again");

        assert!(store.delete(1, 42).unwrap());
        assert!(!store.delete(1, 42).unwrap());
        assert!(matches!(store.read(1, 42), Err(Error::NotFound(_))));
        assert!(matches!(store.read(9, 1), Err(Error::VolumeNotFound(9))));

        let summary = &store.volume_summaries()[0];
        assert!(summary.garbage_bytes > 0);
        assert_eq!(
            summary.size,
            record_len(5) + record_len(11) + record_len(0)
        );
    }

    #[test]
    fn test_reopen_restores_volumes_and_needles() {
        let dir = tempdir().unwrap();
        {
            let store = open(&[dir.path()], &[3]);
            store
                .create_volume(7, 1 << 20, "010".parse().unwrap())
                .unwrap();
            store.write(7, 1, b"a").unwrap();
            store.write(7, 2, b"b").unwrap();
            store.delete(7, 1).unwrap();
        }
        let store = open(&[dir.path()], &[3]);
        assert!(store.has_volume(7));
        assert_eq!(store.read(7, 2).unwrap(), b"b");
        assert!(store.read(7, 1).is_err());
        let summary = &store.volume_summaries()[0];
        assert_eq!(summary.replica_placement.to_string(), "010");
        assert_eq!(store.free_slots(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let store = open(&[dir.path()], &[1]);
            store.create_volume(1, 1 << 20, ReplicaPlacement::default()).unwrap();
            store.write(1, 1, b"intact").unwrap();
        }
        let dat = dir.path().join("1.dat");
        let mut f = OpenOptions::new().append(true).open(&dat).unwrap();
        f.write_all(&NEEDLE_MAGIC).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        drop(f);

        let store = open(&[dir.path()], &[1]);
        assert_eq!(store.read(1, 1).unwrap(), b"intact");
        assert_eq!(fs::metadata(&dat).unwrap().len(), record_len(6));
        store.write(1, 2, b"after").unwrap();
        assert_eq!(store.read(1, 2).unwrap(), b"after");
    }

    #[test]
    fn test_free_slots_per_folder() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let store = open(&[a.path(), b.path()], &[1, 2]);
        assert_eq!(store.free_slots(), 3);

        // Most free slots first
        store.create_volume(1, 1024, ReplicaPlacement::default()).unwrap();
        assert_eq!(store.current_free_slots(1), 1);
        store.create_volume(2, 1024, ReplicaPlacement::default()).unwrap();
        store.create_volume(3, 1024, ReplicaPlacement::default()).unwrap();
        assert_eq!(store.free_slots(), 0);
        assert_eq!(store.current_free_slots(0), 0);
        assert_eq!(store.current_free_slots(5), 0);

        assert!(matches!(
            store.create_volume(4, 1024, ReplicaPlacement::default()),
            Err(Error::CapacityMismatch { .. })
        ));
        // Existing volume is not a second slot
        assert!(!store.create_volume(3, 1024, ReplicaPlacement::default()).unwrap());
    }

    #[test]
    fn test_size_limit() {
        let dir = tempdir().unwrap();
        let store = open(&[dir.path()], &[1]);
        store
            .create_volume(1, record_len(10), ReplicaPlacement::default())
            .unwrap();
        store.write(1, 1, &[0u8; 10]).unwrap();
        assert!(matches!(store.write(1, 2, b"x"), Err(Error::VolumeFull(1))));
        // Deletes still go through on a full volume
        assert!(store.delete(1, 1).unwrap());
    }

    #[test]
    fn test_mismatched_folder_counts() {
        let dir = tempdir().unwrap();
        assert!(Store::open(&[dir.path().to_path_buf()], &[1, 2]).is_err());
    }
}
