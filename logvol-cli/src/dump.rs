use std::path::PathBuf;

use logvol::IndexCursor;
use logvol_error::LogVolResult;

use crate::open;

pub fn exec_dump(path: PathBuf, budget: Option<u64>) -> LogVolResult<()> {
    let file = open(path)?;

    println!(
        "log segments: {}, metadata blobs: {}, flags: {:#x}",
        file.log_segments(),
        file.metadata_blobs(),
        file.stored_flags().bits()
    );
    for desc in file.datasets() {
        println!("dataset {}: {} {}", desc.id, desc.ptype, coords(&desc.dims));
    }

    let budget = budget.unwrap_or(u64::MAX);
    let mut cursor = Some(IndexCursor::default());
    let mut nentries = 0usize;
    while let Some(at) = cursor {
        let partial = file.load_index_partial(at, budget)?;
        log::debug!(
            "loaded {} bytes of records from blob {} section {}",
            partial.bytes,
            at.blob,
            at.section
        );
        for entry in &partial.entries {
            println!(
                "  dataset {} start {} count {} -> segment {} at {} ({} bytes)",
                entry.dataset,
                coords(&entry.block.start),
                coords(&entry.block.count),
                entry.segment,
                entry.offset,
                entry.size
            );
        }
        nentries += partial.entries.len();
        cursor = partial.next;
    }
    println!("{nentries} entries");

    file.close()
}

fn coords(values: &[u64]) -> String {
    let values: Vec<String> = values.iter().map(u64::to_string).collect();
    format!("[{}]", values.join(", "))
}
