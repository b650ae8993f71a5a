use std::fs;
use std::path::PathBuf;

use logvol::{PType, Selection};
use logvol_error::{LogVolResult, logvol_err};

use crate::open;

pub fn exec_replay(
    path: PathBuf,
    dataset: &str,
    out: PathBuf,
    ptype: Option<PType>,
) -> LogVolResult<()> {
    let mut file = open(path)?;
    let id = file.dataset(dataset)?;
    let desc = file.dataset_desc(id)?;
    let ptype = ptype.unwrap_or(desc.ptype);
    let len = usize::try_from(desc.num_elements() * ptype.byte_width() as u64)
        .map_err(|_| logvol_err!(OutOfMemory: "dataset {} does not fit in memory", dataset))?;

    let mut buf = vec![0u8; len];
    file.read(id, &Selection::All, ptype, &mut buf)?;
    fs::write(&out, &buf)?;
    log::info!("wrote {} bytes of {} to {}", len, ptype, out.display());

    file.close()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use logvol::{FileRegistry, LogFile, LogVolOptions, to_le_bytes};
    use logvol_io::{FileStorage, SelfComm};

    use super::*;

    #[test]
    fn replays_dense_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.lv");
        {
            let storage = Arc::new(FileStorage::create(&path).unwrap());
            let mut file = LogFile::create(
                Arc::new(SelfComm),
                storage,
                &FileRegistry::new(),
                LogVolOptions::new(),
            )
            .unwrap();
            let id = file.define_dataset("grid", &[2, 3], PType::U16).unwrap();
            file.write(
                id,
                &Selection::block([1, 0], [1, 3]),
                PType::U16,
                &to_le_bytes(&[4u16, 5, 6]),
            )
            .unwrap();
            file.close().unwrap();
        }

        let out = dir.path().join("grid.raw");
        exec_replay(path, "grid", out.clone(), Some(PType::U8)).unwrap();
        assert_eq!(fs::read(out).unwrap(), vec![0, 0, 0, 4, 5, 6]);
    }
}
