use crate::errors::Result;
use crate::label_mask::{LabelMask, LabelStats};
use serde::{Deserialize, Serialize};

/// Summary written next to every label mask as `<name>_meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// `[height, width]` of the label mask.
    pub image_size: [u32; 2],
    /// Highest label value, read as the number of detected instances.
    pub contours: u32,
}

impl MetadataRecord {
    /// Pretty-printed JSON, two-space indent, UTF-8.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Derives the metadata of a mask. `contours` is the maximum label, which
/// equals the instance count only for dense labels 1..=N; sparse labels are
/// reported in the log with their true count.
pub fn derive(mask: &LabelMask) -> MetadataRecord {
    let stats = LabelStats::from_mask(mask);
    if !stats.is_dense() {
        tracing::warn!(
            max_label = stats.max_label,
            instance_count = stats.instance_count,
            "label mask is not densely numbered; contours overstates the instance count"
        );
    }

    MetadataRecord {
        image_size: [mask.height(), mask.width()],
        contours: stats.max_label,
    }
}
