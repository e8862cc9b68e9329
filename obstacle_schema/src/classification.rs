use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed taxonomy of verdicts an analysis can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomyTag {
    Normal,
    NotAPath,
    Construction,
    Tree,
    Rock,
    Furniture,
    Slope,
    OtherObstacle,
    DownloadError,
    ProcessError,
    InferenceError,
}

impl TaxonomyTag {
    pub const ALL: [TaxonomyTag; 11] = [
        TaxonomyTag::Normal,
        TaxonomyTag::NotAPath,
        TaxonomyTag::Construction,
        TaxonomyTag::Tree,
        TaxonomyTag::Rock,
        TaxonomyTag::Furniture,
        TaxonomyTag::Slope,
        TaxonomyTag::OtherObstacle,
        TaxonomyTag::DownloadError,
        TaxonomyTag::ProcessError,
        TaxonomyTag::InferenceError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyTag::Normal => "normal",
            TaxonomyTag::NotAPath => "not_a_path",
            TaxonomyTag::Construction => "construction",
            TaxonomyTag::Tree => "tree",
            TaxonomyTag::Rock => "rock",
            TaxonomyTag::Furniture => "furniture",
            TaxonomyTag::Slope => "slope",
            TaxonomyTag::OtherObstacle => "other_obstacle",
            TaxonomyTag::DownloadError => "download_error",
            TaxonomyTag::ProcessError => "process_error",
            TaxonomyTag::InferenceError => "inference_error",
        }
    }

    /// Whether this tag blocks pedestrian passage.
    ///
    /// Degraded tags (failed download, unreadable payload, failed inference)
    /// never count as obstacles.
    pub fn is_obstacle(&self) -> bool {
        !matches!(
            self,
            TaxonomyTag::Normal
                | TaxonomyTag::NotAPath
                | TaxonomyTag::DownloadError
                | TaxonomyTag::ProcessError
                | TaxonomyTag::InferenceError
        )
    }
}

impl fmt::Display for TaxonomyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Yes,
    No,
}

impl From<bool> for Verdict {
    fn from(is_obstacle: bool) -> Self {
        if is_obstacle {
            Verdict::Yes
        } else {
            Verdict::No
        }
    }
}

/// Outcome of analyzing one image or a whole batch.
///
/// Only the tag is stored; `is_obstacle` and `analysis_result` are derived
/// from it so the three wire fields can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ClassificationWire", from = "ClassificationWire")]
pub struct Classification {
    tag: TaxonomyTag,
}

impl Classification {
    pub fn new(tag: TaxonomyTag) -> Self {
        Self { tag }
    }

    /// Returned when a batch finishes without any retained result.
    pub fn clear() -> Self {
        Self::new(TaxonomyTag::Normal)
    }

    pub fn tag(&self) -> TaxonomyTag {
        self.tag
    }

    pub fn is_obstacle(&self) -> bool {
        self.tag.is_obstacle()
    }

    pub fn analysis_result(&self) -> Verdict {
        Verdict::from(self.is_obstacle())
    }
}

impl From<TaxonomyTag> for Classification {
    fn from(tag: TaxonomyTag) -> Self {
        Self::new(tag)
    }
}

#[derive(Serialize, Deserialize)]
struct ClassificationWire {
    analysis_result: Verdict,
    is_obstacle: bool,
    tag: TaxonomyTag,
}

impl From<Classification> for ClassificationWire {
    fn from(classification: Classification) -> Self {
        Self {
            analysis_result: classification.analysis_result(),
            is_obstacle: classification.is_obstacle(),
            tag: classification.tag,
        }
    }
}

impl From<ClassificationWire> for Classification {
    fn from(wire: ClassificationWire) -> Self {
        Classification::new(wire.tag)
    }
}
