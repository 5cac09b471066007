//! The fixed command sequences for each supported analysis.

use super::{
    menu, DatasetSpec, DeterministicSkill, GoodnessIndex, MissingValues, ModeLimits,
    ProbabilisticSkill, Script, ScriptBuilder,
};
use crate::error::Result;
use crate::registry::ArtifactKind;
use serde::{Deserialize, Serialize};

/// Output settings shared by every analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub significant_figures: u32,
    pub goodness_index: GoodnessIndex,
    pub missing_values: MissingValues,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            significant_figures: 6,
            goodness_index: GoodnessIndex::KendallsTau,
            missing_values: MissingValues::default(),
        }
    }
}

impl Settings {
    fn apply(&self, b: &mut ScriptBuilder) -> Result<()> {
        b.text_output()?
            .significant_figures(self.significant_figures)?
            .goodness_index(self.goodness_index)?
            .missing_values(&self.missing_values)?;
        Ok(())
    }
}

/// Inputs for the skill verification workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOptions {
    pub predictor: DatasetSpec,
    pub predictand: DatasetSpec,
    #[serde(default = "default_true")]
    pub synchronous_predictors: bool,
    #[serde(default)]
    pub settings: Settings,
}

/// Inputs for CCA, PCR and MLR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionOptions {
    pub predictor: DatasetSpec,
    pub predictand: DatasetSpec,
    /// Produces forecast values and probabilities when present.
    #[serde(default)]
    pub forecast: Option<DatasetSpec>,
    #[serde(default = "default_true")]
    pub synchronous_predictors: bool,
    #[serde(default)]
    pub transform_predictand: bool,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default = "all_deterministic")]
    pub skills: Vec<DeterministicSkill>,
    #[serde(default = "default_true")]
    pub save_hindcasts: bool,
    #[serde(default = "default_true")]
    pub save_loadings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcaModes {
    pub predictor: ModeLimits,
    pub predictand: ModeLimits,
    pub cca: ModeLimits,
}

impl Default for CcaModes {
    fn default() -> Self {
        Self {
            predictor: ModeLimits::new(1, 8),
            predictand: ModeLimits::new(1, 6),
            cca: ModeLimits::new(1, 3),
        }
    }
}

fn default_true() -> bool {
    true
}

fn all_deterministic() -> Vec<DeterministicSkill> {
    DeterministicSkill::ALL.to_vec()
}

fn begin(name: &str, code: i64, synchronous: bool) -> Result<ScriptBuilder> {
    let mut b = ScriptBuilder::new(name);
    b.analysis(code)?;
    if synchronous {
        b.synchronous_predictors()?;
    }
    Ok(b)
}

/// Configure, cross-validate and export everything a regression produces.
fn finish_regression(
    mut b: ScriptBuilder,
    opts: &RegressionOptions,
    loadings: &[ArtifactKind],
) -> Result<Script> {
    opts.settings.apply(&mut b)?;
    if opts.transform_predictand {
        b.transform_predictand()?;
    }
    if let Some(forecast) = &opts.forecast {
        b.load_forecast(forecast)?;
    }
    b.execute(menu::CROSS_VALIDATE)?;

    for skill in &opts.skills {
        b.export_deterministic_skill(*skill)?;
    }
    if opts.save_hindcasts {
        b.export_result(ArtifactKind::HindcastValues)?;
    }
    if opts.save_loadings {
        for kind in loadings {
            b.export_result(*kind)?;
        }
    }
    if opts.forecast.is_some() {
        b.export_result(ArtifactKind::ForecastValues)?;
        b.export_result(ArtifactKind::ForecastProbabilities)?;
    }
    b.synchronize()?;
    b.build()
}

pub fn canonical_correlation_analysis(opts: &RegressionOptions, modes: &CcaModes) -> Result<Script> {
    let mut b = begin("canonical_correlation_analysis", menu::CCA, opts.synchronous_predictors)?;
    b.load_predictor(&opts.predictor)?
        .predictor_modes(modes.predictor)?
        .load_predictand(&opts.predictand)?
        .predictand_modes(modes.predictand)?
        .cca_modes(modes.cca)?;
    finish_regression(
        b,
        opts,
        &[
            ArtifactKind::XEofLoadings,
            ArtifactKind::XEofScores,
            ArtifactKind::YEofLoadings,
            ArtifactKind::YEofScores,
            ArtifactKind::CcaXLoadings,
            ArtifactKind::CcaYLoadings,
        ],
    )
}

pub fn principal_components_regression(
    opts: &RegressionOptions,
    predictor_modes: ModeLimits,
) -> Result<Script> {
    let mut b = begin("principal_components_regression", menu::PCR, opts.synchronous_predictors)?;
    b.load_predictor(&opts.predictor)?
        .predictor_modes(predictor_modes)?
        .load_predictand(&opts.predictand)?;
    finish_regression(
        b,
        opts,
        &[ArtifactKind::XEofLoadings, ArtifactKind::XEofScores],
    )
}

pub fn multiple_regression(opts: &RegressionOptions) -> Result<Script> {
    let mut b = begin("multiple_regression", menu::MLR, opts.synchronous_predictors)?;
    b.load_predictor(&opts.predictor)?
        .load_predictand(&opts.predictand)?;
    finish_regression(b, opts, &[])
}

/// Deterministic skill of forecasts loaded as the predictor.
pub fn deterministic_skill(
    opts: &VerificationOptions,
    skills: &[DeterministicSkill],
) -> Result<Script> {
    let mut b = begin("deterministic_skill", menu::GCM, opts.synchronous_predictors)?;
    b.load_predictor(&opts.predictor)?
        .load_predictand(&opts.predictand)?;
    opts.settings.apply(&mut b)?;
    b.execute(menu::RETROACTIVE)?;
    for skill in skills {
        b.export_deterministic_skill(*skill)?;
    }
    b.synchronize()?;
    b.build()
}

/// Probabilistic skill of tercile forecasts loaded as the predictor.
pub fn probabilistic_forecast_verification(
    opts: &VerificationOptions,
    skills: &[ProbabilisticSkill],
) -> Result<Script> {
    let mut b = begin(
        "probabilistic_forecast_verification",
        menu::PFV,
        opts.synchronous_predictors,
    )?;
    b.load_predictor(&opts.predictor)?
        .load_predictand(&opts.predictand)?;
    opts.settings.apply(&mut b)?;
    b.execute(menu::VERIFY_PROBABILISTIC)?;
    for skill in skills {
        b.export_probabilistic_skill(*skill)?;
    }
    b.synchronize()?;
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::encoder::{Command, Scalar};
    use crate::error::DriverError;
    use crate::workflow::{Domain, Step};

    fn verification() -> VerificationOptions {
        VerificationOptions {
            predictor: DatasetSpec::gridded(
                "/in/x.tsv",
                Domain {
                    north: 10.0,
                    south: -5.0,
                    west: 100.0,
                    east: 120.5,
                },
            ),
            predictand: DatasetSpec::station("/in/y.tsv"),
            synchronous_predictors: true,
            settings: Settings::default(),
        }
    }

    fn regression() -> RegressionOptions {
        RegressionOptions {
            predictor: DatasetSpec::station("/in/x.tsv"),
            predictand: DatasetSpec::station("/in/y.tsv"),
            forecast: Some(DatasetSpec::station("/in/f.tsv")),
            synchronous_predictors: false,
            transform_predictand: false,
            settings: Settings::default(),
            skills: vec![DeterministicSkill::Pearson],
            save_hindcasts: true,
            save_loadings: true,
        }
    }

    /// The commands as the engine sees them, with artifact paths left symbolic.
    fn wire(script: &Script) -> Vec<String> {
        script
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Send(Command::Select(c)) => Some(c.to_string()),
                Step::Send(Command::Scalar(Scalar::Int(v))) => Some(v.to_string()),
                Step::Send(Command::Scalar(Scalar::Float(v))) => Some(v.to_string()),
                Step::SendArtifact(a) => Some(format!("<{a}>")),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pfv_sends_the_documented_sequence() {
        let script =
            probabilistic_forecast_verification(&verification(), &ProbabilisticSkill::ALL)
                .unwrap();
        let expected = [
            "621", "545", "1", "<original_predictor>", "10", "-5", "100", "120.5",
            "2", "<original_predictand>", "131", "2", "132", "6", "531", "3", "544",
            "-999", "10", "10", "-999", "10", "10", "1", "4", "313",
            "437", "1", "<generalized_roc>",
            "437", "2", "<ignorance>",
            "437", "3", "<rank_probability_skill_score>",
        ];
        assert_eq!(wire(&script), expected);
        assert_eq!(script.steps.last(), Some(&Step::Synchronize));
        assert_eq!(
            script.expected(),
            vec!["generalized_roc", "ignorance", "rank_probability_skill_score"]
        );
    }

    #[test]
    fn deterministic_skill_waits_on_exactly_the_requested_metrics() {
        let script = deterministic_skill(
            &verification(),
            &[DeterministicSkill::Spearman, DeterministicSkill::RocBelow],
        )
        .unwrap();
        assert_eq!(script.expected(), vec!["spearman", "roc_below"]);
        let syncs = script
            .steps
            .iter()
            .filter(|s| **s == Step::Synchronize)
            .count();
        assert_eq!(syncs, 1);
    }

    #[test]
    fn cca_sets_all_modes_in_order() {
        let script = canonical_correlation_analysis(&regression(), &CcaModes::default()).unwrap();
        let w = wire(&script);
        assert_eq!(
            &w[..10],
            ["611", "1", "<original_predictor>", "1", "8", "2", "<original_predictand>", "1", "6", "1"]
        );
        assert_eq!(w[10], "3");
        assert!(script.expected().contains(&"cca_y_loadings"));
        assert!(script.expected().contains(&"forecast_probabilities"));
    }

    #[test]
    fn pcr_exports_only_predictor_loadings() {
        let script =
            principal_components_regression(&regression(), ModeLimits::new(1, 5)).unwrap();
        let expected = script.expected();
        assert!(expected.contains(&"x_eof_scores"));
        assert!(!expected.contains(&"y_eof_scores"));
    }

    #[test]
    fn mlr_without_forecast_skips_forecast_outputs() {
        let opts = RegressionOptions {
            forecast: None,
            ..regression()
        };
        let script = multiple_regression(&opts).unwrap();
        assert_eq!(script.expected(), vec!["pearson", "hindcast_values"]);
        assert!(!script.artifacts().contains(&"original_forecast"));
    }

    #[test]
    fn bad_mode_limits_fail_before_any_session() {
        let modes = CcaModes {
            cca: ModeLimits::new(0, 3),
            ..CcaModes::default()
        };
        assert!(matches!(
            canonical_correlation_analysis(&regression(), &modes),
            Err(DriverError::InvalidCommand(_))
        ));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: RegressionOptions = serde_json::from_str(
            r#"{"predictor":{"archive":"/x"},"predictand":{"archive":"/y"}}"#,
        )
        .unwrap();
        assert!(opts.synchronous_predictors);
        assert_eq!(opts.skills.len(), DeterministicSkill::ALL.len());
        assert_eq!(opts.settings.significant_figures, 6);
    }
}
