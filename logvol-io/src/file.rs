use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use logvol_error::{LogVolResult, logvol_err};
use parking_lot::Mutex;

use crate::catalog::Catalog;
use crate::{AllocationPolicy, DatasetInfo, Storage};

/// A container stored in a single file on the local filesystem.
///
/// Raw bytes live in the container file itself. The dataset catalog and attributes live in a
/// JSON sidecar next to it (`<path>.catalog.json`), which is rewritten on every [`Storage::sync`].
pub struct FileStorage {
    identity: String,
    catalog_path: PathBuf,
    policy: AllocationPolicy,
    // Lock order: catalog before file.
    catalog: Mutex<Catalog>,
    file: Mutex<File>,
}

impl FileStorage {
    /// Create an empty container at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> LogVolResult<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let storage = Self::new(path, file, Catalog::default())?;
        storage.save_catalog(&storage.catalog.lock())?;
        Ok(storage)
    }

    /// Open an existing container at `path`.
    pub fn open(path: impl AsRef<Path>) -> LogVolResult<Self> {
        let path = path.as_ref();
        let file = File::options().read(true).write(true).open(path)?;
        let catalog_path = catalog_path(path);
        let reader = BufReader::new(File::open(&catalog_path).map_err(|e| {
            logvol_err!(NotFound: "catalog {} for container {}: {}", catalog_path.display(), path.display(), e)
        })?);
        let catalog: Catalog = serde_json::from_reader(reader)?;
        Self::new(path, file, catalog)
    }

    pub fn with_allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn new(path: &Path, file: File, catalog: Catalog) -> LogVolResult<Self> {
        let identity = fs::canonicalize(path)?.display().to_string();
        Ok(Self {
            identity,
            catalog_path: catalog_path(path),
            policy: AllocationPolicy::default(),
            catalog: Mutex::new(catalog),
            file: Mutex::new(file),
        })
    }

    fn save_catalog(&self, catalog: &Catalog) -> LogVolResult<()> {
        let tmp = self.catalog_path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, catalog)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.catalog_path)?;
        Ok(())
    }

    /// Extend the file so every allocated extent is readable.
    fn extend_to(&self, catalog: &Catalog) -> LogVolResult<()> {
        let file = self.file.lock();
        if file.metadata()?.len() < catalog.end() {
            file.set_len(catalog.end())?;
        }
        Ok(())
    }
}

fn catalog_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".catalog.json");
    PathBuf::from(name)
}

impl Storage for FileStorage {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn create_dataset(&self, name: &str, len: u64) -> LogVolResult<()> {
        let mut catalog = self.catalog.lock();
        catalog.create(name, len, self.policy)?;
        self.extend_to(&catalog)
    }

    fn dataset(&self, name: &str) -> LogVolResult<Option<DatasetInfo>> {
        Ok(self.catalog.lock().dataset(name))
    }

    fn flush_allocation(&self) -> LogVolResult<()> {
        let mut catalog = self.catalog.lock();
        catalog.flush_allocation(self.policy);
        self.extend_to(&catalog)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, bufs)))]
    fn write_at(&self, offset: u64, bufs: &[&[u8]]) -> LogVolResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        for buf in bufs {
            file.write_all(buf)?;
        }
        Ok(())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, out), fields(len = out.len())))]
    fn read_at(&self, offset: u64, out: &mut [u8]) -> LogVolResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(out)?;
        Ok(())
    }

    fn get_attr(&self, name: &str) -> LogVolResult<Option<Vec<i64>>> {
        Ok(self.catalog.lock().attr(name))
    }

    fn put_attr(&self, name: &str, value: &[i64]) -> LogVolResult<()> {
        self.catalog.lock().put_attr(name, value);
        Ok(())
    }

    fn sync(&self) -> LogVolResult<()> {
        let catalog = self.catalog.lock();
        self.file.lock().sync_data()?;
        self.save_catalog(&catalog)?;
        log::debug!("synced container {}", self.identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn reopen_restores_catalog_and_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.lv");
        {
            let storage = FileStorage::create(&path).unwrap();
            storage.create_dataset("a", 4).unwrap();
            storage.create_dataset("b", 4).unwrap();
            storage.write_at(4, &[b"wx", b"yz"]).unwrap();
            storage.put_attr("n", &[2]).unwrap();
            storage.sync().unwrap();
        }
        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(
            storage.dataset("b").unwrap(),
            Some(DatasetInfo {
                len: 4,
                offset: Some(4)
            })
        );
        assert_eq!(storage.get_attr("n").unwrap(), Some(vec![2]));
        let mut out = [0u8; 8];
        storage.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"\0\0\0\0wxyz");
    }

    #[test]
    fn identity_is_canonical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.lv");
        let created = FileStorage::create(&path).unwrap();
        let indirect = dir.path().join(".").join("c.lv");
        let opened = FileStorage::open(&indirect).unwrap();
        assert_eq!(created.identity(), opened.identity());
    }

    #[test]
    fn open_without_catalog_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.lv");
        File::create(&path).unwrap();
        let err = FileStorage::open(&path).err().unwrap();
        assert_eq!(err.status(), -8);
    }
}
