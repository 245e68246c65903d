//! Saving and loading a groups tree.
//!
//! File layout: the magic bytes `QTSORT_GROUPS`, one version byte, then the
//! bincode encoding of a [`GroupsFile`]. Files are written to a temporary
//! path and renamed into place, so a reader never sees a partial file.
//! Loading checks the tree's links and totals before handing it out.

use super::WeightedQuadtree;
use crate::error::{QtSortError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8] = b"QTSORT_GROUPS";
const VERSION: u8 = 1;

/// A groups tree together with the parameters it was found with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsFile {
    pub target: i64,
    pub minsize: i64,
    pub groups: WeightedQuadtree,
}

impl GroupsFile {
    pub fn new(target: i64, minsize: i64, groups: WeightedQuadtree) -> Self {
        Self {
            target,
            minsize,
            groups,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(MAGIC)?;
            writer.write_all(&[VERSION])?;
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        log::info!(
            "saved {} groups ({} nodes) to {}",
            self.groups.num_groups(),
            self.groups.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; MAGIC.len() + 1];
        reader
            .read_exact(&mut header)
            .map_err(|_| QtSortError::InvalidFormat)?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(QtSortError::InvalidFormat);
        }
        if header[MAGIC.len()] != VERSION {
            return Err(QtSortError::Serialization(format!(
                "unsupported groups file version {}",
                header[MAGIC.len()]
            )));
        }

        let file: GroupsFile = bincode::deserialize_from(&mut reader)?;
        file.groups.validate()?;
        log::debug!(
            "loaded {} nodes from {}",
            file.groups.len(),
            path.display()
        );
        Ok(file)
    }
}
