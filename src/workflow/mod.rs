//! Workflow scripts: fixed, ordered command sequences for each analysis.
//!
//! The engine's menus silently misread commands sent in the wrong state, so
//! the order is enforced while a script is built rather than discovered at
//! run time. A finished [`Script`] is a flat list of [`Step`]s; artifact paths
//! inside it stay symbolic until the runner issues them from the registry.

pub mod analyses;
pub mod menu;
pub mod staging;

use crate::engine::encoder::Command;
use crate::error::{DriverError, Result};
use crate::registry::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use analyses::{
    canonical_correlation_analysis, deterministic_skill, multiple_regression,
    principal_components_regression, probabilistic_forecast_verification, CcaModes,
    RegressionOptions, Settings, VerificationOptions,
};
pub use staging::{ArchiveWriter, CopyArchive};

/// One step of a workflow, executed strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Have the formatting collaborator write an input archive at the
    /// artifact's registered path.
    Stage { artifact: String, source: PathBuf },
    Send(Command),
    /// Send the artifact's registered path, resolved when the step runs.
    SendArtifact(String),
    /// The engine will produce this artifact; add it to the pending set.
    Expect(String),
    /// Wait for every expected artifact since the previous synchronize.
    Synchronize,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub steps: Vec<Step>,
    /// Sent when the session closes.
    pub quit: Vec<Command>,
}

impl Script {
    /// Every artifact the script stages, sends or expects.
    pub fn artifacts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            let name = match step {
                Step::Stage { artifact, .. } => artifact.as_str(),
                Step::SendArtifact(a) | Step::Expect(a) => a.as_str(),
                _ => continue,
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Artifacts the engine produces, in request order.
    pub fn expected(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Expect(a) => Some(a.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Geographic bounds sent right after a gridded dataset is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub north: f64,
    pub south: f64,
    pub west: f64,
    pub east: f64,
}

impl Domain {
    fn validate(&self) -> Result<()> {
        let all = [self.north, self.south, self.west, self.east];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(DriverError::InvalidCommand(format!(
                "domain bounds must be finite: {self:?}"
            )));
        }
        if self.north < self.south {
            return Err(DriverError::InvalidCommand(format!(
                "northern bound {} lies south of southern bound {}",
                self.north, self.south
            )));
        }
        Ok(())
    }
}

/// A pre-formatted input archive plus its domain (`None` for station data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub archive: PathBuf,
    #[serde(default)]
    pub domain: Option<Domain>,
}

impl DatasetSpec {
    pub fn station(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            domain: None,
        }
    }

    pub fn gridded(archive: impl Into<PathBuf>, domain: Domain) -> Self {
        Self {
            archive: archive.into(),
            domain: Some(domain),
        }
    }
}

/// Minimum and maximum number of modes the engine may retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeLimits {
    pub min: u32,
    pub max: u32,
}

impl ModeLimits {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.min == 0 || self.min > self.max {
            return Err(DriverError::InvalidCommand(format!(
                "{what} mode limits must satisfy 1 <= min <= max, got {}..{}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodnessIndex {
    Pearson,
    Spearman,
    KendallsTau,
}

impl GoodnessIndex {
    pub fn code(self) -> i64 {
        match self {
            GoodnessIndex::Pearson => 1,
            GoodnessIndex::Spearman => 2,
            GoodnessIndex::KendallsTau => 3,
        }
    }
}

/// Missing-value thresholds for one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissingThresholds {
    pub sentinel: f64,
    pub max_missing_values_pct: f64,
    pub max_missing_gridpoints_pct: f64,
}

impl Default for MissingThresholds {
    fn default() -> Self {
        Self {
            sentinel: -999.0,
            max_missing_values_pct: 10.0,
            max_missing_gridpoints_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissingValues {
    pub predictor: MissingThresholds,
    pub predictand: MissingThresholds,
    /// Engine code for the replacement method (1 = nearest neighbours).
    pub replacement: i64,
    pub neighbours: i64,
}

impl Default for MissingValues {
    fn default() -> Self {
        Self {
            predictor: MissingThresholds::default(),
            predictand: MissingThresholds::default(),
            replacement: 1,
            neighbours: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeterministicSkill {
    Pearson,
    Spearman,
    TwoAfc,
    RocBelow,
    RocAbove,
}

impl DeterministicSkill {
    pub const ALL: [DeterministicSkill; 5] = [
        DeterministicSkill::Pearson,
        DeterministicSkill::Spearman,
        DeterministicSkill::TwoAfc,
        DeterministicSkill::RocBelow,
        DeterministicSkill::RocAbove,
    ];

    pub fn code(self) -> i64 {
        match self {
            DeterministicSkill::Pearson => 1,
            DeterministicSkill::Spearman => 2,
            DeterministicSkill::TwoAfc => 3,
            DeterministicSkill::RocBelow => 10,
            DeterministicSkill::RocAbove => 11,
        }
    }

    pub fn artifact(self) -> ArtifactKind {
        match self {
            DeterministicSkill::Pearson => ArtifactKind::Pearson,
            DeterministicSkill::Spearman => ArtifactKind::Spearman,
            DeterministicSkill::TwoAfc => ArtifactKind::TwoAfc,
            DeterministicSkill::RocBelow => ArtifactKind::RocBelow,
            DeterministicSkill::RocAbove => ArtifactKind::RocAbove,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbabilisticSkill {
    GeneralizedRoc,
    Ignorance,
    RankProbabilitySkillScore,
}

impl ProbabilisticSkill {
    pub const ALL: [ProbabilisticSkill; 3] = [
        ProbabilisticSkill::GeneralizedRoc,
        ProbabilisticSkill::Ignorance,
        ProbabilisticSkill::RankProbabilitySkillScore,
    ];

    pub fn code(self) -> i64 {
        match self {
            ProbabilisticSkill::GeneralizedRoc => 1,
            ProbabilisticSkill::Ignorance => 2,
            ProbabilisticSkill::RankProbabilitySkillScore => 3,
        }
    }

    pub fn artifact(self) -> ArtifactKind {
        match self {
            ProbabilisticSkill::GeneralizedRoc => ArtifactKind::GeneralizedRoc,
            ProbabilisticSkill::Ignorance => ArtifactKind::Ignorance,
            ProbabilisticSkill::RankProbabilitySkillScore => {
                ArtifactKind::RankProbabilitySkillScore
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    Nothing,
    Analysis,
    Synchronous,
    PredictorLoaded,
    PredictorModes,
    PredictandLoaded,
    PredictandModes,
    Other,
}

/// Builds a [`Script`] while checking every ordering precondition.
#[derive(Debug)]
pub struct ScriptBuilder {
    name: String,
    steps: Vec<Step>,
    last: Last,
    analysis: Option<i64>,
    predictor: bool,
    predictand: bool,
    forecast: bool,
    x_modes: bool,
    y_modes: bool,
    cca_modes: bool,
    executed: bool,
    output_open: bool,
    unsynced: usize,
    synced: usize,
}

impl ScriptBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            last: Last::Nothing,
            analysis: None,
            predictor: false,
            predictand: false,
            forecast: false,
            x_modes: false,
            y_modes: false,
            cca_modes: false,
            executed: false,
            output_open: false,
            unsynced: 0,
            synced: 0,
        }
    }

    fn select(&mut self, code: i64) {
        self.steps.push(Step::Send(Command::Select(code)));
    }

    fn scalar(&mut self, v: impl Into<crate::engine::encoder::Scalar>) {
        self.steps.push(Step::Send(Command::Scalar(v.into())));
    }

    fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
        if cond {
            Ok(())
        } else {
            Err(DriverError::ProtocolOrdering(msg()))
        }
    }

    fn needs_x_modes(&self) -> bool {
        matches!(self.analysis, Some(menu::CCA) | Some(menu::PCR))
    }

    fn needs_y_modes(&self) -> bool {
        self.analysis == Some(menu::CCA)
    }

    /// Select the analysis; must be the first command.
    pub fn analysis(&mut self, code: i64) -> Result<&mut Self> {
        Self::ensure(self.last == Last::Nothing, || {
            "the analysis must be selected before any other command".into()
        })?;
        self.select(code);
        self.analysis = Some(code);
        self.last = Last::Analysis;
        Ok(self)
    }

    pub fn synchronous_predictors(&mut self) -> Result<&mut Self> {
        Self::ensure(self.last == Last::Analysis, || {
            "synchronous predictors must directly follow the analysis selection".into()
        })?;
        self.select(menu::SYNCHRONOUS_PREDICTORS);
        self.last = Last::Synchronous;
        Ok(self)
    }

    fn load(
        &mut self,
        code: i64,
        kind: ArtifactKind,
        dataset: &DatasetSpec,
    ) -> Result<()> {
        if let Some(domain) = &dataset.domain {
            domain.validate()?;
        }
        let artifact = kind.name().to_string();
        self.steps.push(Step::Stage {
            artifact: artifact.clone(),
            source: dataset.archive.clone(),
        });
        self.select(code);
        self.steps.push(Step::SendArtifact(artifact));
        // Bounds are only read immediately after the load itself.
        if let Some(d) = dataset.domain {
            self.scalar(d.north);
            self.scalar(d.south);
            self.scalar(d.west);
            self.scalar(d.east);
        }
        Ok(())
    }

    pub fn load_predictor(&mut self, dataset: &DatasetSpec) -> Result<&mut Self> {
        Self::ensure(
            matches!(self.last, Last::Analysis | Last::Synchronous),
            || "the predictor must be loaded right after the analysis selection".into(),
        )?;
        self.load(menu::OPEN_PREDICTOR, ArtifactKind::OriginalPredictor, dataset)?;
        self.predictor = true;
        self.last = Last::PredictorLoaded;
        Ok(self)
    }

    pub fn predictor_modes(&mut self, modes: ModeLimits) -> Result<&mut Self> {
        Self::ensure(self.last == Last::PredictorLoaded && self.needs_x_modes(), || {
            "predictor modes must directly follow the predictor load of a CCA or PCR".into()
        })?;
        modes.validate("predictor")?;
        self.scalar(modes.min as i64);
        self.scalar(modes.max as i64);
        self.x_modes = true;
        self.last = Last::PredictorModes;
        Ok(self)
    }

    pub fn load_predictand(&mut self, dataset: &DatasetSpec) -> Result<&mut Self> {
        Self::ensure(self.predictor && !self.predictand, || {
            "the predictand is loaded once, after the predictor".into()
        })?;
        Self::ensure(!self.needs_x_modes() || self.x_modes, || {
            "predictor modes must be set before the predictand is loaded".into()
        })?;
        self.load(menu::OPEN_PREDICTAND, ArtifactKind::OriginalPredictand, dataset)?;
        self.predictand = true;
        self.last = Last::PredictandLoaded;
        Ok(self)
    }

    pub fn predictand_modes(&mut self, modes: ModeLimits) -> Result<&mut Self> {
        Self::ensure(self.last == Last::PredictandLoaded && self.needs_y_modes(), || {
            "predictand modes must directly follow the predictand load of a CCA".into()
        })?;
        modes.validate("predictand")?;
        self.scalar(modes.min as i64);
        self.scalar(modes.max as i64);
        self.y_modes = true;
        self.last = Last::PredictandModes;
        Ok(self)
    }

    pub fn cca_modes(&mut self, modes: ModeLimits) -> Result<&mut Self> {
        Self::ensure(self.last == Last::PredictandModes, || {
            "CCA modes must directly follow the predictand modes".into()
        })?;
        modes.validate("CCA")?;
        self.scalar(modes.min as i64);
        self.scalar(modes.max as i64);
        self.cca_modes = true;
        self.last = Last::Other;
        Ok(self)
    }

    fn ensure_configurable(&self, what: &str) -> Result<()> {
        Self::ensure(self.predictand && !self.executed, || {
            format!("{what} must be set after both datasets are loaded and before execution")
        })?;
        Self::ensure(!self.needs_y_modes() || (self.y_modes && self.cca_modes), || {
            format!("{what} cannot interrupt the CCA mode settings")
        })
    }

    pub fn text_output(&mut self) -> Result<&mut Self> {
        self.ensure_configurable("the output format")?;
        self.select(menu::OUTPUT_FORMAT);
        self.select(menu::OUTPUT_FORMAT_TEXT);
        self.last = Last::Other;
        Ok(self)
    }

    pub fn significant_figures(&mut self, sigfigs: u32) -> Result<&mut Self> {
        self.ensure_configurable("significant figures")?;
        if sigfigs == 0 {
            return Err(DriverError::InvalidCommand(
                "significant figures must be at least 1".into(),
            ));
        }
        self.select(menu::SIGNIFICANT_FIGURES);
        self.scalar(sigfigs as i64);
        self.last = Last::Other;
        Ok(self)
    }

    pub fn goodness_index(&mut self, index: GoodnessIndex) -> Result<&mut Self> {
        self.ensure_configurable("the goodness index")?;
        self.select(menu::GOODNESS_INDEX);
        self.select(index.code());
        self.last = Last::Other;
        Ok(self)
    }

    pub fn missing_values(&mut self, mv: &MissingValues) -> Result<&mut Self> {
        self.ensure_configurable("missing values")?;
        self.select(menu::MISSING_VALUES);
        for t in [mv.predictor, mv.predictand] {
            self.scalar(t.sentinel);
            self.scalar(t.max_missing_values_pct);
            self.scalar(t.max_missing_gridpoints_pct);
        }
        self.scalar(mv.replacement);
        self.scalar(mv.neighbours);
        self.last = Last::Other;
        Ok(self)
    }

    pub fn transform_predictand(&mut self) -> Result<&mut Self> {
        self.ensure_configurable("the predictand transformation")?;
        self.select(menu::TRANSFORM_PREDICTAND);
        self.last = Last::Other;
        Ok(self)
    }

    pub fn load_forecast(&mut self, dataset: &DatasetSpec) -> Result<&mut Self> {
        self.ensure_configurable("the forecast dataset")?;
        Self::ensure(!self.forecast, || "the forecast dataset is loaded once".into())?;
        self.load(menu::OPEN_FORECAST, ArtifactKind::OriginalForecast, dataset)?;
        self.forecast = true;
        self.last = Last::Other;
        Ok(self)
    }

    /// Run the analysis itself.
    pub fn execute(&mut self, code: i64) -> Result<&mut Self> {
        self.ensure_configurable("execution")?;
        self.select(code);
        self.executed = true;
        self.last = Last::Other;
        Ok(self)
    }

    fn expect(&mut self, kind: ArtifactKind) -> Result<String> {
        let name = kind.name().to_string();
        Self::ensure(
            !self.steps.contains(&Step::Expect(name.clone())),
            || format!("artifact `{name}` is already requested"),
        )?;
        self.steps.push(Step::Expect(name.clone()));
        self.unsynced += 1;
        Ok(name)
    }

    fn close_output(&mut self) {
        if self.output_open {
            self.select(menu::END_OUTPUT);
            self.output_open = false;
        }
    }

    pub fn export_deterministic_skill(&mut self, skill: DeterministicSkill) -> Result<&mut Self> {
        Self::ensure(self.executed, || {
            "skill scores can only be exported after execution".into()
        })?;
        self.close_output();
        let name = self.expect(skill.artifact())?;
        self.select(menu::DETERMINISTIC_SKILL);
        self.select(skill.code());
        self.steps.push(Step::SendArtifact(name));
        Ok(self)
    }

    pub fn export_probabilistic_skill(&mut self, skill: ProbabilisticSkill) -> Result<&mut Self> {
        Self::ensure(self.executed, || {
            "skill scores can only be exported after execution".into()
        })?;
        self.close_output();
        let name = self.expect(skill.artifact())?;
        self.select(menu::PROBABILISTIC_SKILL);
        self.select(skill.code());
        self.steps.push(Step::SendArtifact(name));
        Ok(self)
    }

    /// Save one result file through the output menu.
    pub fn export_result(&mut self, kind: ArtifactKind) -> Result<&mut Self> {
        Self::ensure(self.executed, || {
            "results can only be exported after execution".into()
        })?;
        let code = match kind {
            ArtifactKind::HindcastValues => menu::SAVE_HINDCASTS,
            ArtifactKind::XEofLoadings if self.x_modes => menu::SAVE_X_EOF_LOADINGS,
            ArtifactKind::XEofScores if self.x_modes => menu::SAVE_X_EOF_SCORES,
            ArtifactKind::YEofLoadings if self.y_modes => menu::SAVE_Y_EOF_LOADINGS,
            ArtifactKind::YEofScores if self.y_modes => menu::SAVE_Y_EOF_SCORES,
            ArtifactKind::CcaXLoadings if self.cca_modes => menu::SAVE_CCA_X_LOADINGS,
            ArtifactKind::CcaYLoadings if self.cca_modes => menu::SAVE_CCA_Y_LOADINGS,
            ArtifactKind::ForecastValues if self.forecast => menu::SAVE_FORECAST_VALUES,
            ArtifactKind::ForecastProbabilities if self.forecast => {
                menu::SAVE_FORECAST_PROBABILITIES
            }
            other => {
                return Err(DriverError::ProtocolOrdering(format!(
                    "`{}` is not produced by this analysis",
                    other.name()
                )))
            }
        };
        let name = self.expect(kind)?;
        if kind == ArtifactKind::ForecastProbabilities {
            self.close_output();
            self.select(menu::PROBABILISTIC_FORECAST);
        }
        if !self.output_open {
            self.select(menu::OUTPUT_RESULTS);
            self.output_open = true;
        }
        self.select(code);
        self.steps.push(Step::SendArtifact(name));
        Ok(self)
    }

    /// Wait for everything requested since the previous synchronize.
    pub fn synchronize(&mut self) -> Result<&mut Self> {
        Self::ensure(self.unsynced > 0, || {
            "nothing has been requested since the last synchronize".into()
        })?;
        self.close_output();
        self.steps.push(Step::Synchronize);
        self.synced += self.unsynced;
        self.unsynced = 0;
        Ok(self)
    }

    pub fn build(&mut self) -> Result<Script> {
        Self::ensure(self.executed, || "the script never executes the analysis".into())?;
        Self::ensure(self.synced > 0, || "the script never waits for any artifact".into())?;
        Self::ensure(self.unsynced == 0, || {
            format!("{} requested artifact(s) are never synchronized", self.unsynced)
        })?;
        Ok(Script {
            name: self.name.clone(),
            steps: std::mem::take(&mut self.steps),
            quit: vec![Command::Select(menu::EXIT)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Domain {
        Domain {
            north: 20.0,
            south: -10.0,
            west: 30.0,
            east: 60.0,
        }
    }

    fn loaded_mlr() -> ScriptBuilder {
        let mut b = ScriptBuilder::new("mlr");
        b.analysis(menu::MLR)
            .unwrap()
            .load_predictor(&DatasetSpec::gridded("/in/x.tsv", grid()))
            .unwrap()
            .load_predictand(&DatasetSpec::station("/in/y.tsv"))
            .unwrap();
        b
    }

    #[test]
    fn bounds_follow_the_load_directly() {
        let b = loaded_mlr();
        let steps = &b.steps;
        assert_eq!(steps[1], Step::Stage {
            artifact: "original_predictor".into(),
            source: "/in/x.tsv".into(),
        });
        assert_eq!(steps[2], Step::Send(Command::Select(menu::OPEN_PREDICTOR)));
        assert_eq!(steps[3], Step::SendArtifact("original_predictor".into()));
        let bounds: Vec<_> = steps[4..8].to_vec();
        assert_eq!(
            bounds,
            [20.0, -10.0, 30.0, 60.0]
                .into_iter()
                .map(|v| Step::Send(Command::scalar(v)))
                .collect::<Vec<_>>()
        );
        // Station predictand: no bounds after its path.
        assert_eq!(steps[10], Step::SendArtifact("original_predictand".into()));
        assert_eq!(steps.len(), 11);
    }

    #[test]
    fn analysis_must_come_first() {
        let mut b = ScriptBuilder::new("x");
        assert!(matches!(
            b.load_predictor(&DatasetSpec::station("/x")),
            Err(DriverError::ProtocolOrdering(_))
        ));
        b.analysis(menu::PCR).unwrap();
        assert!(b.analysis(menu::CCA).is_err());
    }

    #[test]
    fn predictand_before_predictor_is_rejected() {
        let mut b = ScriptBuilder::new("x");
        b.analysis(menu::MLR).unwrap();
        assert!(matches!(
            b.load_predictand(&DatasetSpec::station("/y")),
            Err(DriverError::ProtocolOrdering(_))
        ));
    }

    #[test]
    fn pcr_requires_predictor_modes_before_predictand() {
        let mut b = ScriptBuilder::new("pcr");
        b.analysis(menu::PCR)
            .unwrap()
            .load_predictor(&DatasetSpec::station("/x"))
            .unwrap();
        assert!(b.load_predictand(&DatasetSpec::station("/y")).is_err());
        b.predictor_modes(ModeLimits::new(1, 8)).unwrap();
        b.load_predictand(&DatasetSpec::station("/y")).unwrap();
        // Predictand modes are a CCA-only setting.
        assert!(b.predictand_modes(ModeLimits::new(1, 3)).is_err());
    }

    #[test]
    fn invalid_inputs_are_invalid_commands() {
        let mut b = ScriptBuilder::new("x");
        b.analysis(menu::PCR).unwrap();
        let bad = Domain {
            north: -5.0,
            ..grid()
        };
        assert!(matches!(
            b.load_predictor(&DatasetSpec::gridded("/x", bad)),
            Err(DriverError::InvalidCommand(_))
        ));
        b.load_predictor(&DatasetSpec::station("/x")).unwrap();
        assert!(matches!(
            b.predictor_modes(ModeLimits::new(4, 2)),
            Err(DriverError::InvalidCommand(_))
        ));
    }

    #[test]
    fn settings_only_between_loads_and_execution() {
        let mut b = ScriptBuilder::new("x");
        b.analysis(menu::MLR).unwrap();
        assert!(b.goodness_index(GoodnessIndex::Pearson).is_err());
        let mut b = loaded_mlr();
        b.goodness_index(GoodnessIndex::KendallsTau)
            .unwrap()
            .execute(menu::CROSS_VALIDATE)
            .unwrap();
        assert!(b.significant_figures(6).is_err());
        assert!(b.execute(menu::CROSS_VALIDATE).is_err());
    }

    #[test]
    fn exports_need_execution_and_a_synchronize() {
        let mut b = loaded_mlr();
        assert!(b
            .export_deterministic_skill(DeterministicSkill::Pearson)
            .is_err());
        b.execute(menu::CROSS_VALIDATE).unwrap();
        assert!(b.synchronize().is_err());
        b.export_deterministic_skill(DeterministicSkill::Pearson)
            .unwrap();
        assert!(b
            .export_deterministic_skill(DeterministicSkill::Pearson)
            .is_err());
        assert!(b.build().is_err());
        b.synchronize().unwrap();
        let script = b.build().unwrap();
        assert_eq!(script.expected(), vec!["pearson"]);
        assert_eq!(script.quit, vec![Command::Select(menu::EXIT)]);
    }

    #[test]
    fn expect_precedes_the_export_commands() {
        let mut b = loaded_mlr();
        b.execute(menu::CROSS_VALIDATE)
            .unwrap()
            .export_deterministic_skill(DeterministicSkill::RocAbove)
            .unwrap()
            .synchronize()
            .unwrap();
        let script = b.build().unwrap();
        let tail: Vec<_> = script.steps[script.steps.len() - 5..].to_vec();
        assert_eq!(
            tail,
            vec![
                Step::Expect("roc_above".into()),
                Step::Send(Command::Select(menu::DETERMINISTIC_SKILL)),
                Step::Send(Command::Select(11)),
                Step::SendArtifact("roc_above".into()),
                Step::Synchronize,
            ]
        );
    }

    #[test]
    fn output_menu_is_opened_once_and_closed_before_waiting() {
        let mut b = loaded_mlr();
        b.execute(menu::CROSS_VALIDATE)
            .unwrap()
            .export_result(ArtifactKind::HindcastValues)
            .unwrap();
        assert!(b.export_result(ArtifactKind::XEofLoadings).is_err());
        b.synchronize().unwrap();
        let script = b.build().unwrap();
        let opens = script
            .steps
            .iter()
            .filter(|s| **s == Step::Send(Command::Select(menu::OUTPUT_RESULTS)))
            .count();
        assert_eq!(opens, 1);
        let n = script.steps.len();
        assert_eq!(script.steps[n - 2], Step::Send(Command::Select(menu::END_OUTPUT)));
        assert_eq!(
            script.artifacts(),
            vec!["original_predictor", "original_predictand", "hindcast_values"]
        );
    }

    #[test]
    fn repeated_forecast_probabilities_leave_no_stray_commands() {
        let mut b = loaded_mlr();
        b.load_forecast(&DatasetSpec::station("/in/f.tsv"))
            .unwrap()
            .execute(menu::CROSS_VALIDATE)
            .unwrap()
            .export_result(ArtifactKind::ForecastProbabilities)
            .unwrap();
        let before = b.steps.clone();
        assert!(matches!(
            b.export_result(ArtifactKind::ForecastProbabilities),
            Err(DriverError::ProtocolOrdering(_))
        ));
        assert_eq!(b.steps, before);

        let start = before
            .iter()
            .position(|s| *s == Step::Expect("forecast_probabilities".into()))
            .unwrap();
        assert_eq!(
            before[start + 1],
            Step::Send(Command::Select(menu::PROBABILISTIC_FORECAST))
        );
    }
}
