//! End-to-end runs of image analysis workflows on an in-memory experiment

mod common;

use std::sync::Arc;

use common::{feature_names, value_of, ExperimentFixture};
use tmengine::aggregation::Statistic;
use tmengine::steps::default_registry;
use tmengine::storage::HierarchyLevel;
use tmengine::workflow::{
    CollectJob, JobRunner, LocalSubmitter, ResourceRequest, WorkflowState, WorkflowStateMachine,
    WorkflowStep,
};

const SEGMENTATION: &str =
    "image-analysis {experiment_dir} --pipeline pipelines/segmentation --batch-size 2";

fn machine(fixture: &ExperimentFixture, lines: &[&str]) -> WorkflowStateMachine {
    WorkflowStateMachine::new(
        fixture.commands(lines),
        Arc::new(default_registry()),
        fixture.context(),
        Arc::new(LocalSubmitter::new(2)),
    )
}

#[tokio::test]
async fn test_workflow_runs_pipeline_and_aggregates() {
    let fixture = ExperimentFixture::new(5).await;
    let location = fixture.write_pipeline("segmentation");

    let mut machine = machine(&fixture, &[SEGMENTATION]);
    let state = machine.run().await.unwrap();
    assert_eq!(state, WorkflowState::Terminated, "{:?}", machine.last_error());
    assert_eq!(machine.exit_code(), 0);

    let batch_sizes: Vec<usize> = machine.tasks()[0]
        .jobs
        .run
        .iter()
        .map(|job| job.batch.site_ids.len())
        .collect();
    assert_eq!(batch_sizes, vec![2, 2, 1]);
    assert!(machine.outcomes()[0].succeeded());
    assert!(location.join("collect.json").exists());
    assert!(location.join("figures").is_dir());
    assert!(location.join("batches").join("batch_3.json").exists());

    let snapshot = fixture.store.snapshot().await;
    assert_eq!(feature_names(&snapshot, "Cells"), vec!["area", "intensity"]);
    let cells = snapshot.mapobject_type_by_name("Cells").unwrap();
    assert_eq!(snapshot.feature_values_of_type(cells.id).len(), 10);

    // structural types carry only derived features
    let site_features = feature_names(&snapshot, HierarchyLevel::Site.as_str());
    assert_eq!(site_features.len(), 2 * Statistic::ALL.len());
    assert!(site_features.contains(&"intensity_Cells_Mean".to_string()));
    assert!(!site_features.contains(&"area".to_string()));
    assert!(snapshot
        .features
        .values()
        .filter(|f| f.mapobject_type_id != cells.id)
        .all(|f| f.is_aggregate));

    let (first_well, second_well) = (fixture.wells[0], fixture.wells[1]);
    assert_eq!(value_of(&snapshot, first_well, "area_Cells_Count"), 6.0);
    assert_eq!(value_of(&snapshot, first_well, "intensity_Cells_Mean"), 2.0);
    assert_eq!(value_of(&snapshot, first_well, "intensity_Cells_Sum"), 12.0);
    assert_eq!(value_of(&snapshot, second_well, "intensity_Cells_Max"), 5.0);
    assert_eq!(value_of(&snapshot, second_well, "area_Cells_Count"), 4.0);

    assert_eq!(value_of(&snapshot, fixture.plate, "area_Cells_Count"), 10.0);
    assert_eq!(value_of(&snapshot, fixture.plate, "intensity_Cells_Min"), 1.0);
    assert_eq!(value_of(&snapshot, fixture.plate, "intensity_Cells_Mean"), 3.25);
    assert_eq!(value_of(&snapshot, fixture.plate, "area_Cells_Mean"), 4.0);
}

#[tokio::test]
async fn test_collect_is_idempotent() {
    let fixture = ExperimentFixture::new(4).await;
    fixture.write_pipeline("segmentation");
    let mut machine = machine(&fixture, &[SEGMENTATION]);
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Terminated);
    let before = fixture.store.snapshot().await;

    let command = fixture.commands(&[SEGMENTATION]).remove(0);
    let step = default_registry()
        .create(&command, &fixture.context())
        .unwrap();
    step.collect(&CollectJob {
        resources: ResourceRequest::default(),
    })
    .await
    .unwrap();

    let after = fixture.store.snapshot().await;
    assert_eq!(before.features, after.features);
    for well in &fixture.wells {
        assert_eq!(
            value_of(&before, *well, "intensity_Cells_Mean"),
            value_of(&after, *well, "intensity_Cells_Mean")
        );
    }
    assert_eq!(before.feature_values.len(), after.feature_values.len());
}

#[tokio::test]
async fn test_rerun_replaces_previous_objects() {
    let fixture = ExperimentFixture::new(3).await;
    fixture.write_pipeline("segmentation");
    for _ in 0..2 {
        let mut machine = machine(&fixture, &[SEGMENTATION]);
        assert_eq!(machine.run().await.unwrap(), WorkflowState::Terminated);
    }
    let snapshot = fixture.store.snapshot().await;
    let cells = snapshot.mapobject_type_by_name("Cells").unwrap();
    assert_eq!(snapshot.feature_values_of_type(cells.id).len(), 6);
    assert_eq!(feature_names(&snapshot, "Cells").len(), 2);
}

#[tokio::test]
async fn test_plotting_requires_single_site_batches() {
    let fixture = ExperimentFixture::new(3).await;
    fixture.write_pipeline("segmentation");
    let mut machine = machine(
        &fixture,
        &["image-analysis --pipeline pipelines/segmentation --batch-size 10 --plot"],
    );
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Aborted);
    assert_eq!(machine.exit_code(), 1);
    assert!(machine.outcomes().is_empty());
    assert!(machine
        .last_error()
        .unwrap()
        .contains("Batch size must be 1 when plotting is active"));
}

#[tokio::test]
async fn test_missing_upstream_output_aborts_next_step() {
    let fixture = ExperimentFixture::new(2).await;
    fixture.write_pipeline("segmentation");
    let mut machine = machine(
        &fixture,
        &[
            SEGMENTATION,
            "image-analysis --pipeline pipelines/measurement --batch-size 1",
        ],
    );
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Aborted);
    assert_eq!(machine.exit_code(), 1);
    assert_eq!(machine.outcomes().len(), 1);
    assert!(machine.last_error().unwrap().contains("pipeline.yaml"));
}

#[tokio::test]
async fn test_failing_module_aborts_workflow() {
    let fixture = ExperimentFixture::new(2).await;
    fixture.write_pipeline_with("segmentation", "reject");
    let mut machine = machine(&fixture, &[SEGMENTATION]);
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Aborted);
    let outcome = &machine.outcomes()[0];
    assert_eq!(outcome.failed_jobs().count(), 1);
    assert!(outcome.collect.is_none());
    assert!(machine.last_error().unwrap().contains("collect.json"));
}

#[tokio::test]
async fn test_unregistered_module_aborts_before_submission() {
    let fixture = ExperimentFixture::new(2).await;
    fixture.write_pipeline_with("segmentation", "unregistered");
    let mut machine = machine(&fixture, &[SEGMENTATION]);
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Aborted);
    assert_eq!(machine.exit_code(), 1);
    assert!(machine.outcomes().is_empty());
    assert!(machine
        .last_error()
        .unwrap()
        .contains("No native module named \"unregistered\""));
}

#[tokio::test]
async fn test_planning_jobs_keeps_previous_results() {
    let fixture = ExperimentFixture::new(3).await;
    let location = fixture.write_pipeline("segmentation");
    let mut machine = machine(&fixture, &[SEGMENTATION]);
    assert_eq!(machine.run().await.unwrap(), WorkflowState::Terminated);

    let command = fixture.commands(&[SEGMENTATION]).remove(0);
    let step = default_registry()
        .create(&command, &fixture.context())
        .unwrap();
    let jobs = step.plan_jobs(2).await.unwrap();
    assert_eq!(jobs.run.len(), 2);
    assert!(location.join("collect.json").exists());
    let snapshot = fixture.store.snapshot().await;
    let cells = snapshot.mapobject_type_by_name("Cells").unwrap();
    assert_eq!(snapshot.feature_values_of_type(cells.id).len(), 6);

    step.create_jobs(2).await.unwrap();
    assert!(!location.join("collect.json").exists());
    assert!(fixture.store.snapshot().await.mapobject_type_by_name("Cells").is_none());
}
