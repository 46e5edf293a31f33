//! Integration tests for the hierarchy store
//!
//! Covers:
//! - Cascading deletes and the events they publish
//! - Epic token rollup and the non-decreasing rule
//! - Dependency cycle rejection and detection
//! - Statistics, progress and validation reports

use std::sync::{Arc, Mutex};

use codehive_core::{
    CodehiveError, CreateEpic, CreateInstruction, CreateStory, CreateTask, DependencyEdge,
    DependencyLevel, DependencyType, Epic, Event, EventBus, EventKind, EventSink, HierarchyLevel,
    Instruction, Status, Story, Task, UpdateInstruction, UpdateStory, UpdateTask,
};
use codehive_store::{FileStore, HierarchyStore, MemoryStore, RecordStore, RecordStoreExt};

struct Fixture {
    hierarchy: HierarchyStore,
    store: Arc<dyn RecordStore>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

fn fixture() -> Fixture {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let bus = EventBus::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let sink: Arc<dyn EventSink> = Arc::new(move |event: &Event| {
        seen.lock().unwrap().push(event.name());
    });
    bus.subscribe_all(sink);

    Fixture {
        hierarchy: HierarchyStore::new(store.clone(), bus),
        store,
        events,
    }
}

/// Epic with one story, one task and `instructions` instructions
async fn seed(
    h: &HierarchyStore,
    instructions: usize,
) -> (Epic, Story, Task, Vec<Instruction>) {
    let epic = h
        .create_epic(CreateEpic::new("project-1", "Authentication"))
        .await
        .unwrap();
    let story = h
        .create_story(CreateStory::new(&epic.id, "Login").with_story_points(5))
        .await
        .unwrap();
    let task = h
        .create_task(CreateTask::new(&story.id, "Login endpoint").with_estimate(30))
        .await
        .unwrap();
    let mut created = Vec::new();
    for n in 0..instructions {
        created.push(
            h.create_instruction(CreateInstruction::new(
                &task.id,
                format!("step {}", n + 1),
                "compiles",
            ))
            .await
            .unwrap(),
        );
    }
    (epic, story, task, created)
}

#[tokio::test]
async fn test_delete_epic_cascades_to_descendants_and_edges() {
    let f = fixture();
    let (epic, story, task, instructions) = seed(&f.hierarchy, 2).await;
    f.hierarchy
        .add_dependency(
            DependencyLevel::Instruction,
            &instructions[1].id,
            &instructions[0].id,
            DependencyType::Sequential,
        )
        .await
        .unwrap();

    f.hierarchy.delete_epic(&epic.id).await.unwrap();

    assert!(f.hierarchy.get_epic(&epic.id).await.unwrap_err().is_not_found());
    assert!(f.hierarchy.get_story(&story.id).await.unwrap_err().is_not_found());
    assert!(f.hierarchy.get_task(&task.id).await.unwrap_err().is_not_found());
    for instruction in &instructions {
        assert!(f
            .hierarchy
            .get_instruction(&instruction.id)
            .await
            .unwrap_err()
            .is_not_found());
    }
    let edges: Vec<DependencyEdge> = f
        .store
        .scan_records(&codehive_store::Filter::all())
        .await
        .unwrap();
    assert!(edges.is_empty());

    let events = f.events.lock().unwrap();
    assert!(events.contains(&"instruction:deleted"));
    assert!(events.contains(&"dependency:removed"));
    assert!(events.contains(&"task:deleted"));
    assert!(events.contains(&"story:deleted"));
    assert_eq!(events.last(), Some(&"epic:deleted"));
}

#[tokio::test]
async fn test_delete_missing_epic_is_not_found() {
    let f = fixture();
    let err = f.hierarchy.delete_epic("ghost").await.unwrap_err();
    assert_eq!(err.to_string(), "Epic not found: ghost");
}

#[tokio::test]
async fn test_token_usage_rolls_up_to_epic() {
    let f = fixture();
    let (epic, story, task, instructions) = seed(&f.hierarchy, 2).await;

    f.hierarchy
        .record_token_usage(HierarchyLevel::Instruction, &instructions[0].id, 100)
        .await
        .unwrap();
    f.hierarchy
        .record_token_usage(HierarchyLevel::Instruction, &instructions[1].id, 50)
        .await
        .unwrap();
    f.hierarchy
        .update_task(
            &task.id,
            UpdateTask {
                token_usage: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let total = f
        .hierarchy
        .record_token_usage(HierarchyLevel::Story, &story.id, 5)
        .await
        .unwrap();
    assert_eq!(total, 5);

    let epic = f.hierarchy.get_epic(&epic.id).await.unwrap();
    assert_eq!(epic.token_usage, 175);
}

#[tokio::test]
async fn test_token_usage_never_decreases() {
    let f = fixture();
    let (_epic, story, _task, instructions) = seed(&f.hierarchy, 1).await;

    f.hierarchy
        .update_story(
            &story.id,
            UpdateStory {
                token_usage: Some(40),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = f
        .hierarchy
        .update_story(
            &story.id,
            UpdateStory {
                token_usage: Some(39),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CodehiveError::Validation(_)));

    // Equal is allowed
    f.hierarchy
        .update_instruction(
            &instructions[0].id,
            UpdateInstruction {
                token_usage: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_add_dependency_rejects_cycles() {
    let f = fixture();
    let (_epic, story, _task, _) = seed(&f.hierarchy, 0).await;
    let mut ids = Vec::new();
    for title in ["a", "b", "c"] {
        let task = f
            .hierarchy
            .create_task(CreateTask::new(&story.id, title))
            .await
            .unwrap();
        ids.push(task.id);
    }

    f.hierarchy
        .add_dependency(DependencyLevel::Task, &ids[1], &ids[0], DependencyType::Blocks)
        .await
        .unwrap();
    f.hierarchy
        .add_dependency(DependencyLevel::Task, &ids[2], &ids[1], DependencyType::Blocks)
        .await
        .unwrap();

    let err = f
        .hierarchy
        .add_dependency(DependencyLevel::Task, &ids[0], &ids[2], DependencyType::Blocks)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cycle"));

    let err = f
        .hierarchy
        .add_dependency(DependencyLevel::Task, &ids[0], &ids[0], DependencyType::Blocks)
        .await
        .unwrap_err();
    assert!(matches!(err, CodehiveError::Validation(_)));

    let deps = f
        .hierarchy
        .list_dependencies(DependencyLevel::Task, &ids[1])
        .await
        .unwrap();
    assert_eq!(deps.len(), 2);
}

#[tokio::test]
async fn test_remove_dependency_checks_level() {
    let f = fixture();
    let (_epic, _story, _task, instructions) = seed(&f.hierarchy, 2).await;
    let edge = f
        .hierarchy
        .add_dependency(
            DependencyLevel::Instruction,
            &instructions[1].id,
            &instructions[0].id,
            DependencyType::Sequential,
        )
        .await
        .unwrap();

    let err = f
        .hierarchy
        .remove_dependency(DependencyLevel::Task, &edge.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    f.hierarchy
        .remove_dependency(DependencyLevel::Instruction, &edge.id)
        .await
        .unwrap();
    assert!(f
        .hierarchy
        .list_dependencies(DependencyLevel::Instruction, &instructions[0].id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_statistics_and_progress() {
    let f = fixture();
    let epic = f
        .hierarchy
        .create_epic(CreateEpic::new("project-1", "Checkout"))
        .await
        .unwrap();

    let mut stories = Vec::new();
    for (title, points) in [("cart", 3), ("payment", 5), ("receipt", 8)] {
        stories.push(
            f.hierarchy
                .create_story(CreateStory::new(&epic.id, title).with_story_points(points))
                .await
                .unwrap(),
        );
    }
    // 2 tasks, 1 task, 0 tasks
    for (story, count) in stories.iter().zip([2, 1, 0]) {
        for n in 0..count {
            f.hierarchy
                .create_task(CreateTask::new(&story.id, format!("task {}", n)))
                .await
                .unwrap();
        }
    }
    let first_task = f.hierarchy.list_tasks(&stories[0].id).await.unwrap().remove(0);
    f.hierarchy
        .update_task(
            &first_task.id,
            UpdateTask {
                status: Some(Status::Completed),
                actual_minutes: Some(40),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    f.hierarchy
        .update_story(
            &stories[2].id,
            UpdateStory {
                status: Some(Status::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stats = f.hierarchy.get_epic_statistics(&epic.id).await.unwrap();
    assert_eq!(stats.stories.total, 3);
    assert_eq!(stats.stories.completed, 1);
    assert_eq!(stats.tasks.total, 3);
    assert_eq!(stats.tasks.completed, 1);
    assert_eq!(stats.progress, 33);
    assert!((stats.average_story_points - 16.0 / 3.0).abs() < 1e-9);
    assert!((stats.average_task_minutes - 40.0).abs() < 1e-9);

    let progress = f.hierarchy.get_hierarchy_progress(&epic.id).await.unwrap();
    assert_eq!(
        progress.total_tasks,
        progress.stories.iter().map(|s| s.total_tasks).sum::<usize>()
    );
    assert_eq!(progress.total_tasks, 3);
    assert_eq!(progress.stories[0].progress, 50);
    assert_eq!(progress.stories[2].progress, 0);
    assert!(progress.progress <= 100);

    let project = f
        .hierarchy
        .get_hierarchy_statistics("project-1")
        .await
        .unwrap();
    assert_eq!(project.epics.total, 1);
    assert_eq!(project.stories.total, 3);
    assert_eq!(project.instructions.total, 0);
}

#[tokio::test]
async fn test_epic_without_stories_has_zero_progress() {
    let f = fixture();
    let epic = f
        .hierarchy
        .create_epic(CreateEpic::new("project-1", "Empty"))
        .await
        .unwrap();

    let stats = f.hierarchy.get_epic_statistics(&epic.id).await.unwrap();
    assert_eq!(stats.progress, 0);

    let report = f.hierarchy.validate_hierarchy(&epic.id).await.unwrap();
    assert!(report.is_valid);
    assert_eq!(report.warnings.len(), 1);
}

#[tokio::test]
async fn test_validation_reports_duplicate_sequence() {
    let f = fixture();
    let (epic, _story, _task, instructions) = seed(&f.hierarchy, 2).await;

    // Bypass the create-time check to simulate imported data
    let mut duplicate = instructions[1].clone();
    duplicate.sequence = instructions[0].sequence;
    f.store.put_record(&duplicate).await.unwrap();

    let report = f.hierarchy.validate_hierarchy(&epic.id).await.unwrap();
    assert!(!report.is_valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("duplicate instruction sequence 1")));
}

#[tokio::test]
async fn test_validation_detects_dependency_cycle() {
    let f = fixture();
    let (epic, _story, _task, instructions) = seed(&f.hierarchy, 2).await;
    let a = &instructions[0].id;
    let b = &instructions[1].id;

    f.store
        .put_record(&DependencyEdge::new(
            DependencyLevel::Instruction,
            a,
            b,
            DependencyType::Blocks,
        ))
        .await
        .unwrap();
    f.store
        .put_record(&DependencyEdge::new(
            DependencyLevel::Instruction,
            b,
            a,
            DependencyType::Blocks,
        ))
        .await
        .unwrap();

    let report = f.hierarchy.validate_hierarchy(&epic.id).await.unwrap();
    assert!(!report.is_valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.starts_with("Circular instruction dependency")));
}

#[tokio::test]
async fn test_validation_warns_on_empty_levels() {
    let f = fixture();
    let (epic, story, _task, _) = seed(&f.hierarchy, 0).await;
    f.hierarchy
        .create_story(CreateStory::new(&epic.id, "No tasks yet"))
        .await
        .unwrap();

    let report = f.hierarchy.validate_hierarchy(&epic.id).await.unwrap();
    assert!(report.is_valid);
    assert!(report.warnings.iter().any(|w| w.contains("has no tasks")));
    assert!(report.warnings.iter().any(|w| w.contains("has no instructions")));
    assert!(!report.warnings.iter().any(|w| w.contains(&story.id) && w.contains("no tasks")));
}

#[tokio::test]
async fn test_kind_listener_receives_only_its_events() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let bus = EventBus::new();
    let created = Arc::new(Mutex::new(0usize));
    let counter = created.clone();
    let sink: Arc<dyn EventSink> = Arc::new(move |_: &Event| {
        *counter.lock().unwrap() += 1;
    });
    bus.subscribe(EventKind::TaskCreated, sink);

    let h = HierarchyStore::new(store, bus);
    seed(&h, 3).await;
    assert_eq!(*created.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_file_store_backed_hierarchy_persists() {
    let dir = tempfile::tempdir().unwrap();
    let epic_id = {
        let store: Arc<dyn RecordStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let h = HierarchyStore::new(store, EventBus::new());
        let (epic, _, _, instructions) = seed(&h, 1).await;
        h.record_token_usage(HierarchyLevel::Instruction, &instructions[0].id, 12)
            .await
            .unwrap();
        epic.id
    };

    let store: Arc<dyn RecordStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let h = HierarchyStore::new(store, EventBus::new());
    let epic = h.get_epic(&epic_id).await.unwrap();
    assert_eq!(epic.token_usage, 12);
    assert_eq!(h.list_stories(&epic_id).await.unwrap().len(), 1);
}
