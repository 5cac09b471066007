//! Output registry: logical artifact names mapped to destination paths.
//!
//! Paths are resolved lazily when a command is issued, so an override made
//! before that point reaches every later command. Once a path has gone into
//! the command stream (or the registry is frozen) it can no longer change.

use crate::engine::encoder::absolute;
use crate::error::{DriverError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Every artifact the workflows know how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    OriginalPredictor,
    OriginalPredictand,
    OriginalForecast,
    GoodnessIndex,
    Pearson,
    Spearman,
    TwoAfc,
    RocBelow,
    RocAbove,
    GeneralizedRoc,
    Ignorance,
    RankProbabilitySkillScore,
    HindcastValues,
    ForecastValues,
    ForecastProbabilities,
    XEofLoadings,
    XEofScores,
    YEofLoadings,
    YEofScores,
    CcaXLoadings,
    CcaYLoadings,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 21] = [
        ArtifactKind::OriginalPredictor,
        ArtifactKind::OriginalPredictand,
        ArtifactKind::OriginalForecast,
        ArtifactKind::GoodnessIndex,
        ArtifactKind::Pearson,
        ArtifactKind::Spearman,
        ArtifactKind::TwoAfc,
        ArtifactKind::RocBelow,
        ArtifactKind::RocAbove,
        ArtifactKind::GeneralizedRoc,
        ArtifactKind::Ignorance,
        ArtifactKind::RankProbabilitySkillScore,
        ArtifactKind::HindcastValues,
        ArtifactKind::ForecastValues,
        ArtifactKind::ForecastProbabilities,
        ArtifactKind::XEofLoadings,
        ArtifactKind::XEofScores,
        ArtifactKind::YEofLoadings,
        ArtifactKind::YEofScores,
        ArtifactKind::CcaXLoadings,
        ArtifactKind::CcaYLoadings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArtifactKind::OriginalPredictor => "original_predictor",
            ArtifactKind::OriginalPredictand => "original_predictand",
            ArtifactKind::OriginalForecast => "original_forecast",
            ArtifactKind::GoodnessIndex => "goodness_index",
            ArtifactKind::Pearson => "pearson",
            ArtifactKind::Spearman => "spearman",
            ArtifactKind::TwoAfc => "two_afc",
            ArtifactKind::RocBelow => "roc_below",
            ArtifactKind::RocAbove => "roc_above",
            ArtifactKind::GeneralizedRoc => "generalized_roc",
            ArtifactKind::Ignorance => "ignorance",
            ArtifactKind::RankProbabilitySkillScore => "rank_probability_skill_score",
            ArtifactKind::HindcastValues => "hindcast_values",
            ArtifactKind::ForecastValues => "forecast_values",
            ArtifactKind::ForecastProbabilities => "forecast_probabilities",
            ArtifactKind::XEofLoadings => "x_eof_loadings",
            ArtifactKind::XEofScores => "x_eof_scores",
            ArtifactKind::YEofLoadings => "y_eof_loadings",
            ArtifactKind::YEofScores => "y_eof_scores",
            ArtifactKind::CcaXLoadings => "cca_x_loadings",
            ArtifactKind::CcaYLoadings => "cca_y_loadings",
        }
    }

    pub fn from_name(name: &str) -> Option<ArtifactKind> {
        ArtifactKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    issued: bool,
}

#[derive(Debug, Clone)]
pub struct OutputRegistry {
    entries: BTreeMap<String, Entry>,
    suffix: String,
    frozen: bool,
}

impl OutputRegistry {
    /// Registry with every known artifact placed directly under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let entries = ArtifactKind::ALL
            .iter()
            .map(|k| {
                (
                    k.name().to_string(),
                    Entry {
                        path: root.join(k.name()),
                        issued: false,
                    },
                )
            })
            .collect();
        Self {
            entries,
            suffix: String::new(),
            frozen: false,
        }
    }

    /// `~/.workspace`, falling back to the current directory when no home is known.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".workspace")
    }

    /// Extension the engine appends to every path it is given, e.g. `txt`.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.suffix = match suffix.trim_start_matches('.') {
            "" => String::new(),
            ext => format!(".{ext}"),
        };
        self
    }

    pub fn resolve(&self, name: &str) -> Result<&Path> {
        self.entries
            .get(name)
            .map(|e| e.path.as_path())
            .ok_or_else(|| DriverError::UnknownArtifact(name.to_string()))
    }

    pub fn override_path(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let frozen = self.frozen;
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| DriverError::UnknownArtifact(name.to_string()))?;
        if entry.issued {
            return Err(DriverError::OverrideAfterUse {
                artifact: name.to_string(),
                reason: format!(
                    "{} was already sent to the engine",
                    entry.path.display()
                ),
            });
        }
        if frozen {
            return Err(DriverError::OverrideAfterUse {
                artifact: name.to_string(),
                reason: "the registry is frozen for a running workflow".into(),
            });
        }
        let path = absolute(path.as_ref())?;
        debug!(artifact = name, path = %path.display(), "artifact path overridden");
        entry.path = path;
        Ok(())
    }

    /// Resolve a path that is about to go into the command stream.
    pub fn issue(&mut self, name: &str) -> Result<PathBuf> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| DriverError::UnknownArtifact(name.to_string()))?;
        entry.issued = true;
        Ok(entry.path.clone())
    }

    pub fn is_issued(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.issued)
    }

    /// The file the engine actually writes for `name`.
    pub fn artifact_file(&self, name: &str) -> Result<PathBuf> {
        let path = self.resolve(name)?;
        if self.suffix.is_empty() {
            return Ok(path.to_path_buf());
        }
        let mut os = path.as_os_str().to_os_string();
        os.push(&self.suffix);
        Ok(PathBuf::from(os))
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Reserve the files behind `names` for one session.
    pub fn claim<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<PathClaim> {
        let mut paths = Vec::new();
        for name in names {
            let file = self.artifact_file(name)?;
            if !paths.contains(&file) {
                paths.push(file);
            }
        }
        PathClaim::acquire(paths)
    }
}

fn claimed() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide reservation of artifact files; released on drop.
#[derive(Debug)]
pub struct PathClaim {
    paths: Vec<PathBuf>,
}

impl PathClaim {
    fn acquire(paths: Vec<PathBuf>) -> Result<Self> {
        let mut set = claimed().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(taken) = paths.iter().find(|p| set.contains(*p)) {
            return Err(DriverError::DestinationConflict {
                path: taken.clone(),
            });
        }
        set.extend(paths.iter().cloned());
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut set = claimed().lock().unwrap_or_else(|e| e.into_inner());
        for p in &self.paths {
            set.remove(p);
        }
    }
}
