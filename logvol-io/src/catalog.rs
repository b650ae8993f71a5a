use std::collections::BTreeMap;

use logvol_error::{LogVolResult, logvol_bail};
use serde::{Deserialize, Serialize};

use crate::{AllocationPolicy, DatasetInfo};

/// The dataset and attribute directory of a container.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Catalog {
    datasets: BTreeMap<String, DatasetInfo>,
    attrs: BTreeMap<String, Vec<i64>>,
    /// First unallocated byte of the container.
    end: u64,
}

impl Catalog {
    pub(crate) fn create(
        &mut self,
        name: &str,
        len: u64,
        policy: AllocationPolicy,
    ) -> LogVolResult<()> {
        if self.datasets.contains_key(name) {
            logvol_bail!("dataset {} already exists", name);
        }
        let offset = match policy {
            AllocationPolicy::Immediate => Some(self.allocate(len)),
            AllocationPolicy::OnFlush | AllocationPolicy::Never => None,
        };
        self.datasets
            .insert(name.to_string(), DatasetInfo { len, offset });
        Ok(())
    }

    pub(crate) fn dataset(&self, name: &str) -> Option<DatasetInfo> {
        self.datasets.get(name).copied()
    }

    /// Assign space to deferred datasets, in name order.
    pub(crate) fn flush_allocation(&mut self, policy: AllocationPolicy) {
        if policy == AllocationPolicy::Never {
            return;
        }
        let mut end = self.end;
        for info in self.datasets.values_mut() {
            if info.offset.is_none() {
                info.offset = Some(end);
                end += info.len;
            }
        }
        self.end = end;
    }

    pub(crate) fn end(&self) -> u64 {
        self.end
    }

    pub(crate) fn attr(&self, name: &str) -> Option<Vec<i64>> {
        self.attrs.get(name).cloned()
    }

    pub(crate) fn put_attr(&mut self, name: &str, value: &[i64]) {
        self.attrs.insert(name.to_string(), value.to_vec());
    }

    fn allocate(&mut self, len: u64) -> u64 {
        let offset = self.end;
        self.end += len;
        offset
    }
}
