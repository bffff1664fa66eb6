use std::collections::HashMap;

use gpu_list_exporter_common::GpuIndex;
use log::{debug, warn};

use super::{CollectError, gpu::smi_records};

pub const UUID_QUERY_FIELDS: &str = "index,uuid";

/// Index substituted when a UUID has no mapping.
pub const FALLBACK_INDEX: GpuIndex = 0;

/// Maps the long-form GPU UUID reported by the compute-apps query to the short
/// index used by the device query and by metric labels.
#[derive(Debug, Clone, Default)]
pub struct UuidIndex {
    by_uuid: HashMap<String, GpuIndex>,
}

impl UuidIndex {
    /// Build from `index,uuid` rows. Pairs that do not parse are skipped.
    pub fn parse(output: &[u8]) -> Result<Self, CollectError> {
        let mut by_uuid = HashMap::new();

        for record in smi_records(output) {
            let record = record?;
            if record.len() != 2 {
                debug!("Skipping index/uuid row with {} columns", record.len());
                continue;
            }

            match record[0].parse::<GpuIndex>() {
                Ok(index) if !record[1].is_empty() => {
                    by_uuid.insert(record[1].to_string(), index);
                }
                _ => debug!("Skipping index/uuid row {:?}", record),
            }
        }

        Ok(Self { by_uuid })
    }

    /// Resolve a UUID to its index.
    ///
    /// A miss falls back to [`FALLBACK_INDEX`] instead of failing.
    pub fn resolve(&self, uuid: &str) -> GpuIndex {
        match self.by_uuid.get(uuid) {
            Some(index) => *index,
            None => {
                warn!(
                    "No index known for GPU {:?}; attributing to GPU {}",
                    uuid, FALLBACK_INDEX
                );
                FALLBACK_INDEX
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_uuid.len()
    }
}
