//! End-to-end workflow runs against a fake engine that writes its outputs.

mod common;

use common::{fast_policy, sh_engine, WRITING_ENGINE};
use cpt_driver::engine::EngineSession;
use cpt_driver::model::DriverEvent;
use cpt_driver::registry::OutputRegistry;
use cpt_driver::workflow::{
    self, CopyArchive, DatasetSpec, DeterministicSkill, Domain, ProbabilisticSkill,
    RegressionOptions, Settings, VerificationOptions,
};
use cpt_driver::{run_workflow, DriverError};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn inputs(dir: &Path) -> VerificationOptions {
    let x = dir.join("x.tsv");
    let y = dir.join("y.tsv");
    std::fs::write(&x, "xmlns:cpt=http://iri.columbia.edu/CPT/v10/\n").unwrap();
    std::fs::write(&y, "xmlns:cpt=http://iri.columbia.edu/CPT/v10/\n").unwrap();
    VerificationOptions {
        predictor: DatasetSpec::gridded(
            x,
            Domain {
                north: 15.0,
                south: -15.0,
                west: 90.0,
                east: 150.0,
            },
        ),
        predictand: DatasetSpec::station(y),
        synchronous_predictors: true,
        settings: Settings::default(),
    }
}

fn writing_session() -> EngineSession {
    let mut cfg = sh_engine(WRITING_ENGINE);
    cfg.sync = fast_policy(Duration::from_secs(20));
    EngineSession::new(cfg)
}

#[tokio::test]
async fn pfv_run_delivers_every_requested_metric() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let opts = inputs(tmp.path());
    let script =
        workflow::probabilistic_forecast_verification(&opts, &ProbabilisticSkill::ALL).unwrap();

    let mut registry = OutputRegistry::new(&ws).with_suffix("txt");
    let report = run_workflow(writing_session(), &mut registry, &script, &CopyArchive)
        .await
        .unwrap();

    assert_eq!(report.workflow, "probabilistic_forecast_verification");
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.artifacts.len(), 3);
    for name in ["generalized_roc", "ignorance", "rank_probability_skill_score"] {
        let file = &report.artifacts[name];
        assert_eq!(file, &ws.join(format!("{name}.txt")));
        assert_eq!(std::fs::read_to_string(file).unwrap(), "0.12 0.34 0.56\n");
    }
    // Input archives were staged at their registered paths.
    assert!(ws.join("original_predictor").is_file());
    assert!(ws.join("original_predictand").is_file());
    // 35 workflow commands plus the quit selection.
    assert_eq!(report.commands_sent, 36);
}

#[tokio::test]
async fn overrides_reach_the_engine_and_lock_afterwards() {
    let tmp = TempDir::new().unwrap();
    let opts = inputs(tmp.path());
    let script =
        workflow::deterministic_skill(&opts, &[DeterministicSkill::Pearson]).unwrap();

    let custom = tmp.path().join("elsewhere/pearson_run1");
    let mut registry = OutputRegistry::new(tmp.path().join("ws")).with_suffix("txt");
    registry.override_path("pearson", &custom).unwrap();

    let report = run_workflow(writing_session(), &mut registry, &script, &CopyArchive)
        .await
        .unwrap();
    assert_eq!(
        report.artifacts["pearson"],
        tmp.path().join("elsewhere/pearson_run1.txt")
    );

    let err = registry
        .override_path("pearson", tmp.path().join("late"))
        .unwrap_err();
    assert!(matches!(err, DriverError::OverrideAfterUse { .. }));
}

#[tokio::test]
async fn stale_outputs_from_a_previous_run_are_not_trusted() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("spearman.txt"), "stale").unwrap();

    let opts = inputs(tmp.path());
    let script =
        workflow::deterministic_skill(&opts, &[DeterministicSkill::Spearman]).unwrap();
    // An engine that never writes anything.
    let mut cfg = sh_engine("cat > /dev/null");
    cfg.sync = fast_policy(Duration::from_millis(400));

    let mut registry = OutputRegistry::new(&ws).with_suffix("txt");
    let err = run_workflow(EngineSession::new(cfg), &mut registry, &script, &CopyArchive)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Timeout { ref artifact, .. } if artifact == "spearman"));
    assert!(!ws.join("spearman.txt").exists());
}

#[tokio::test]
async fn concurrent_runs_cannot_share_a_destination() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("shared");
    let opts = inputs(tmp.path());
    let script =
        workflow::deterministic_skill(&opts, &[DeterministicSkill::TwoAfc]).unwrap();

    let holder = OutputRegistry::new(&ws).with_suffix("txt");
    let _claim = holder.claim(["two_afc"]).unwrap();

    let mut registry = OutputRegistry::new(&ws).with_suffix("txt");
    let err = run_workflow(writing_session(), &mut registry, &script, &CopyArchive)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::DestinationConflict { .. }), "{err:?}");
}

#[tokio::test]
async fn engine_rejecting_an_input_fails_the_whole_run() {
    let tmp = TempDir::new().unwrap();
    let opts = inputs(tmp.path());
    let script = workflow::multiple_regression(&RegressionOptions {
        predictor: opts.predictor.clone(),
        predictand: opts.predictand.clone(),
        forecast: None,
        synchronous_predictors: false,
        transform_predictand: false,
        settings: Settings::default(),
        skills: vec![DeterministicSkill::Pearson],
        save_hindcasts: true,
        save_loadings: false,
    })
    .unwrap();

    // Dies on the first path it receives.
    let mut cfg = sh_engine(
        "while IFS= read -r l; do case \"$l\" in /*) echo \"cannot open $l\" >&2; exit 5;; esac; done",
    );
    cfg.sync = fast_policy(Duration::from_secs(20));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = EngineSession::new(cfg).with_events(tx);

    let mut registry = OutputRegistry::new(tmp.path().join("ws")).with_suffix("txt");
    let err = run_workflow(session, &mut registry, &script, &CopyArchive)
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(
        matches!(
            err,
            DriverError::EngineExit { .. } | DriverError::EngineRejected { .. }
        ),
        "{err:?}"
    );
    assert!(text.contains("cannot open"), "{text}");

    let mut staged = 0;
    while let Some(ev) = rx.recv().await {
        match ev {
            DriverEvent::ArtifactStaged { .. } => staged += 1,
            DriverEvent::ArtifactReady { name, .. } => panic!("{name} reported ready"),
            _ => {}
        }
    }
    assert!(staged >= 1);
}

#[tokio::test]
async fn cancel_from_another_task_stops_the_run() {
    let tmp = TempDir::new().unwrap();
    let opts = inputs(tmp.path());
    let script = workflow::deterministic_skill(&opts, &DeterministicSkill::ALL).unwrap();
    let mut cfg = sh_engine("cat > /dev/null");
    cfg.sync = fast_policy(Duration::from_secs(60));
    let session = EngineSession::new(cfg);
    let controller = session.controller();

    let mut registry = OutputRegistry::new(tmp.path().join("ws")).with_suffix("txt");
    let run = run_workflow(session, &mut registry, &script, &CopyArchive);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);
    assert!(matches!(result, Err(DriverError::Cancelled { .. })), "{result:?}");
}
