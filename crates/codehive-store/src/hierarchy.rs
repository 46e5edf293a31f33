//! Epic / Story / Task / Instruction management
//!
//! The store owns the four hierarchy tables plus the dependency edge table.
//! Every mutation publishes an event on the shared [`EventBus`].
//!
//! Token usage only grows. An epic's `token_usage` is derived: it is the sum
//! of the usage recorded on every story, task and instruction beneath it and
//! is recomputed whenever one of those changes.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use codehive_core::{
    CodehiveError, CreateEpic, CreateInstruction, CreateStory, CreateTask, DependencyEdge,
    DependencyLevel, DependencyType, Epic, Event, EventBus, HierarchyLevel, Instruction, Result,
    Status, Story, Task, UpdateEpic, UpdateInstruction, UpdateStory, UpdateTask,
};

use crate::graph::DependencyGraph;
use crate::record::{Filter, Record, RecordStore, RecordStoreExt};

impl Record for Epic {
    const TABLE: &'static str = "epics";
    const KIND: &'static str = "Epic";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Story {
    const TABLE: &'static str = "stories";
    const KIND: &'static str = "Story";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Task {
    const TABLE: &'static str = "tasks";
    const KIND: &'static str = "Task";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Instruction {
    const TABLE: &'static str = "instructions";
    const KIND: &'static str = "Instruction";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for DependencyEdge {
    const TABLE: &'static str = "dependencies";
    const KIND: &'static str = "Dependency";

    fn record_id(&self) -> &str {
        &self.id
    }
}

fn table_for(level: HierarchyLevel) -> &'static str {
    match level {
        HierarchyLevel::Epic => Epic::TABLE,
        HierarchyLevel::Story => Story::TABLE,
        HierarchyLevel::Task => Task::TABLE,
        HierarchyLevel::Instruction => Instruction::TABLE,
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CodehiveError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// `round(completed / total * 100)`, 0 for an empty set
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u8
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub total: usize,
    pub completed: usize,
}

impl LevelCounts {
    fn of<'a>(statuses: impl Iterator<Item = &'a Status>) -> Self {
        statuses.fold(Self::default(), |mut acc, status| {
            acc.total += 1;
            if *status == Status::Completed {
                acc.completed += 1;
            }
            acc
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HierarchyStatistics {
    pub project_id: String,
    pub epics: LevelCounts,
    pub stories: LevelCounts,
    pub tasks: LevelCounts,
    pub instructions: LevelCounts,
    pub total_token_usage: u64,
    pub average_story_points: f64,
    /// Mean `actual_minutes` over tasks that recorded one
    pub average_task_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpicStatistics {
    pub epic_id: String,
    pub stories: LevelCounts,
    pub tasks: LevelCounts,
    pub instructions: LevelCounts,
    pub token_usage: u64,
    pub average_story_points: f64,
    pub average_task_minutes: f64,
    /// Percentage of completed stories
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub total_instructions: usize,
    pub completed_instructions: usize,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryProgress {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub progress: u8,
    pub tasks: Vec<TaskProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HierarchyProgress {
    pub epic_id: String,
    pub title: String,
    pub status: Status,
    pub total_stories: usize,
    pub completed_stories: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub progress: u8,
    pub stories: Vec<StoryProgress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Everything beneath a set of epics, loaded in one pass
#[derive(Debug, Default)]
struct Subtree {
    epics: Vec<Epic>,
    stories: Vec<Story>,
    tasks: Vec<Task>,
    instructions: Vec<Instruction>,
}

impl Subtree {
    fn average_story_points(&self) -> f64 {
        mean(self.stories.iter().filter_map(|s| s.story_points).map(f64::from))
    }

    fn average_task_minutes(&self) -> f64 {
        mean(self.tasks.iter().filter_map(|t| t.actual_minutes).map(f64::from))
    }

    fn descendant_token_usage(&self) -> u64 {
        self.stories.iter().map(|s| s.token_usage).sum::<u64>()
            + self.tasks.iter().map(|t| t.token_usage).sum::<u64>()
            + self.instructions.iter().map(|i| i.token_usage).sum::<u64>()
    }
}

/// Hierarchy CRUD, dependency graph, rollups and validation
pub struct HierarchyStore {
    store: Arc<dyn RecordStore>,
    events: EventBus,
    /// Serializes read-check-write sequences (sequence allocation, token checks, edges)
    write_lock: Mutex<()>,
    /// Serializes epic token recomputation
    rollup_lock: Mutex<()>,
}

impl HierarchyStore {
    pub fn new(store: Arc<dyn RecordStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            write_lock: Mutex::new(()),
            rollup_lock: Mutex::new(()),
        }
    }

    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---------------------------------------------------------------------
    // Epics
    // ---------------------------------------------------------------------

    #[instrument(skip(self, input), fields(project_id = %input.project_id))]
    pub async fn create_epic(&self, input: CreateEpic) -> Result<Epic> {
        require("title", &input.title)?;
        require("project_id", &input.project_id)?;

        let epic = input.into_epic();
        self.store.put_record(&epic).await?;
        info!(epic_id = %epic.id, "Created epic");
        self.events.publish(Event::EpicCreated(epic.clone()));
        Ok(epic)
    }

    pub async fn get_epic(&self, id: &str) -> Result<Epic> {
        self.store.get_record(id).await
    }

    pub async fn list_epics(&self, project_id: &str) -> Result<Vec<Epic>> {
        let mut epics: Vec<Epic> = self
            .store
            .scan_records(&Filter::all().eq("project_id", project_id))
            .await?;
        epics.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(epics)
    }

    #[instrument(skip(self, update))]
    pub async fn update_epic(&self, id: &str, update: UpdateEpic) -> Result<Epic> {
        if let Some(title) = &update.title {
            require("title", title)?;
        }
        let epic: Epic = {
            let _guard = self.write_lock.lock().await;
            self.apply_update(id, &update, update.status, None).await?
        };
        self.events.publish(Event::EpicUpdated(epic.clone()));
        Ok(epic)
    }

    /// Delete an epic with all its stories, tasks, instructions and edges
    #[instrument(skip(self))]
    pub async fn delete_epic(&self, id: &str) -> Result<()> {
        self.get_epic(id).await?;

        for story in self.list_stories(id).await? {
            self.delete_story_tree(&story.id).await?;
        }
        self.remove_edges_touching(DependencyLevel::Epic, id).await?;
        self.store.delete(Epic::TABLE, id).await?;

        info!(epic_id = %id, "Deleted epic");
        self.events.publish(Event::EpicDeleted { id: id.to_string() });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Stories
    // ---------------------------------------------------------------------

    #[instrument(skip(self, input), fields(epic_id = %input.epic_id))]
    pub async fn create_story(&self, input: CreateStory) -> Result<Story> {
        require("title", &input.title)?;
        self.ensure_exists(HierarchyLevel::Epic, &input.epic_id).await?;

        let story = input.into_story();
        self.store.put_record(&story).await?;
        info!(story_id = %story.id, "Created story");
        self.events.publish(Event::StoryCreated(story.clone()));
        Ok(story)
    }

    pub async fn get_story(&self, id: &str) -> Result<Story> {
        self.store.get_record(id).await
    }

    pub async fn list_stories(&self, epic_id: &str) -> Result<Vec<Story>> {
        let mut stories: Vec<Story> = self
            .store
            .scan_records(&Filter::all().eq("epic_id", epic_id))
            .await?;
        stories.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stories)
    }

    #[instrument(skip(self, update))]
    pub async fn update_story(&self, id: &str, update: UpdateStory) -> Result<Story> {
        if let Some(title) = &update.title {
            require("title", title)?;
        }
        let story: Story = {
            let _guard = self.write_lock.lock().await;
            self.apply_update(id, &update, update.status, update.token_usage)
                .await?
        };
        self.events.publish(Event::StoryUpdated(story.clone()));

        if update.token_usage.is_some() {
            self.recompute_epic_tokens(&story.epic_id).await?;
        }
        Ok(story)
    }

    #[instrument(skip(self))]
    pub async fn delete_story(&self, id: &str) -> Result<()> {
        let story = self.get_story(id).await?;
        self.delete_story_tree(id).await?;
        self.recompute_epic_tokens(&story.epic_id).await?;
        Ok(())
    }

    async fn delete_story_tree(&self, id: &str) -> Result<()> {
        for task in self.list_tasks(id).await? {
            self.delete_task_tree(&task.id).await?;
        }
        self.store.delete(Story::TABLE, id).await?;
        debug!(story_id = %id, "Deleted story");
        self.events.publish(Event::StoryDeleted { id: id.to_string() });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    #[instrument(skip(self, input), fields(story_id = %input.story_id))]
    pub async fn create_task(&self, input: CreateTask) -> Result<Task> {
        require("title", &input.title)?;
        require("task_type", &input.task_type)?;
        self.ensure_exists(HierarchyLevel::Story, &input.story_id).await?;

        let task = input.into_task();
        self.store.put_record(&task).await?;
        info!(task_id = %task.id, "Created task");
        self.events.publish(Event::TaskCreated(task.clone()));
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.store.get_record(id).await
    }

    pub async fn list_tasks(&self, story_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store
            .scan_records(&Filter::all().eq("story_id", story_id))
            .await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    #[instrument(skip(self, update))]
    pub async fn update_task(&self, id: &str, update: UpdateTask) -> Result<Task> {
        if let Some(title) = &update.title {
            require("title", title)?;
        }
        if let Some(task_type) = &update.task_type {
            require("task_type", task_type)?;
        }
        let task: Task = {
            let _guard = self.write_lock.lock().await;
            self.apply_update(id, &update, update.status, update.token_usage)
                .await?
        };
        self.events.publish(Event::TaskUpdated(task.clone()));

        if update.token_usage.is_some() {
            let epic_id = self.epic_id_for(HierarchyLevel::Task, id).await?;
            self.recompute_epic_tokens(&epic_id).await?;
        }
        Ok(task)
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let epic_id = self.epic_id_for(HierarchyLevel::Task, id).await?;
        self.delete_task_tree(id).await?;
        self.recompute_epic_tokens(&epic_id).await?;
        Ok(())
    }

    async fn delete_task_tree(&self, id: &str) -> Result<()> {
        for instruction in self.list_instructions(id).await? {
            self.delete_instruction_record(&instruction.id).await?;
        }
        self.remove_edges_touching(DependencyLevel::Task, id).await?;
        self.store.delete(Task::TABLE, id).await?;
        debug!(task_id = %id, "Deleted task");
        self.events.publish(Event::TaskDeleted { id: id.to_string() });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Instructions
    // ---------------------------------------------------------------------

    #[instrument(skip(self, input), fields(task_id = %input.task_id))]
    pub async fn create_instruction(&self, input: CreateInstruction) -> Result<Instruction> {
        require("directive", &input.directive)?;
        require("expected_outcome", &input.expected_outcome)?;
        self.ensure_exists(HierarchyLevel::Task, &input.task_id).await?;

        let instruction = {
            let _guard = self.write_lock.lock().await;
            let existing = self.list_instructions(&input.task_id).await?;
            let sequence = match input.sequence {
                Some(seq) => {
                    if existing.iter().any(|i| i.sequence == seq) {
                        return Err(CodehiveError::Validation(format!(
                            "Instruction sequence {} already used in task {}",
                            seq, input.task_id
                        )));
                    }
                    seq
                }
                None => existing.iter().map(|i| i.sequence).max().unwrap_or(0) + 1,
            };
            let instruction = input.into_instruction(sequence);
            self.store.put_record(&instruction).await?;
            instruction
        };

        info!(
            instruction_id = %instruction.id,
            sequence = instruction.sequence,
            "Created instruction"
        );
        self.events
            .publish(Event::InstructionCreated(instruction.clone()));
        Ok(instruction)
    }

    pub async fn get_instruction(&self, id: &str) -> Result<Instruction> {
        self.store.get_record(id).await
    }

    /// Instructions of a task in `sequence` order
    pub async fn list_instructions(&self, task_id: &str) -> Result<Vec<Instruction>> {
        let mut instructions: Vec<Instruction> = self
            .store
            .scan_records(&Filter::all().eq("task_id", task_id))
            .await?;
        instructions.sort_by_key(|i| i.sequence);
        Ok(instructions)
    }

    #[instrument(skip(self, update))]
    pub async fn update_instruction(
        &self,
        id: &str,
        update: UpdateInstruction,
    ) -> Result<Instruction> {
        let instruction: Instruction = {
            let _guard = self.write_lock.lock().await;
            if let Some(seq) = update.sequence {
                let current = self.get_instruction(id).await?;
                let siblings = self.list_instructions(&current.task_id).await?;
                if siblings.iter().any(|i| i.id != id && i.sequence == seq) {
                    return Err(CodehiveError::Validation(format!(
                        "Instruction sequence {} already used in task {}",
                        seq, current.task_id
                    )));
                }
            }
            self.apply_update(id, &update, update.status, update.token_usage)
                .await?
        };
        self.events
            .publish(Event::InstructionUpdated(instruction.clone()));

        if update.token_usage.is_some() {
            let epic_id = self
                .epic_id_for(HierarchyLevel::Task, &instruction.task_id)
                .await?;
            self.recompute_epic_tokens(&epic_id).await?;
        }
        Ok(instruction)
    }

    #[instrument(skip(self))]
    pub async fn delete_instruction(&self, id: &str) -> Result<()> {
        let epic_id = self.epic_id_for(HierarchyLevel::Instruction, id).await?;
        self.delete_instruction_record(id).await?;
        self.recompute_epic_tokens(&epic_id).await?;
        Ok(())
    }

    async fn delete_instruction_record(&self, id: &str) -> Result<()> {
        self.remove_edges_touching(DependencyLevel::Instruction, id)
            .await?;
        self.store.delete(Instruction::TABLE, id).await?;
        self.events
            .publish(Event::InstructionDeleted { id: id.to_string() });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Token usage
    // ---------------------------------------------------------------------

    /// Add `delta` tokens to a story, task or instruction and roll up the epic
    #[instrument(skip(self))]
    pub async fn record_token_usage(
        &self,
        level: HierarchyLevel,
        id: &str,
        delta: u64,
    ) -> Result<u64> {
        if level == HierarchyLevel::Epic {
            return Err(CodehiveError::Validation(
                "Epic token usage is derived from its descendants".to_string(),
            ));
        }
        self.ensure_exists(level, id).await?;

        let delta = i64::try_from(delta)
            .map_err(|_| CodehiveError::Validation(format!("token delta too large: {}", delta)))?;
        let total = self
            .store
            .increment(table_for(level), id, "token_usage", delta)
            .await?;

        let epic_id = self.epic_id_for(level, id).await?;
        self.recompute_epic_tokens(&epic_id).await?;
        Ok(total.max(0) as u64)
    }

    /// Set an epic's `token_usage` to the sum over all of its descendants
    pub async fn recompute_epic_tokens(&self, epic_id: &str) -> Result<u64> {
        let _guard = self.rollup_lock.lock().await;

        let epic = self.get_epic(epic_id).await?;
        let subtree = self.load_subtree(vec![epic]).await?;
        let total = subtree.descendant_token_usage();

        let doc = self
            .store
            .update(
                Epic::TABLE,
                epic_id,
                json!({ "token_usage": total, "updated_at": Utc::now() }),
            )
            .await?;
        let epic: Epic = serde_json::from_value(doc)?;
        debug!(epic_id = %epic_id, token_usage = total, "Rolled up epic token usage");
        self.events.publish(Event::EpicUpdated(epic));
        Ok(total)
    }

    // ---------------------------------------------------------------------
    // Dependencies
    // ---------------------------------------------------------------------

    /// Add `from -> to` ("from depends on to"), rejecting cycles
    #[instrument(skip(self))]
    pub async fn add_dependency(
        &self,
        level: DependencyLevel,
        from: &str,
        to: &str,
        dep_type: DependencyType,
    ) -> Result<DependencyEdge> {
        if from == to {
            return Err(CodehiveError::Validation(format!(
                "{} cannot depend on itself",
                from
            )));
        }
        self.ensure_exists(level.hierarchy_level(), from).await?;
        self.ensure_exists(level.hierarchy_level(), to).await?;

        let edge = {
            let _guard = self.write_lock.lock().await;
            let edges = self.edges(level).await?;
            if edges.iter().any(|e| e.from_id == from && e.to_id == to) {
                return Err(CodehiveError::Validation(format!(
                    "Dependency {} -> {} already exists",
                    from, to
                )));
            }
            if DependencyGraph::from_edges(&edges).would_cycle(from, to) {
                return Err(CodehiveError::Validation(format!(
                    "Dependency {} -> {} would create a cycle",
                    from, to
                )));
            }

            let edge = DependencyEdge::new(level, from, to, dep_type);
            self.store.put_record(&edge).await?;
            edge
        };

        info!(edge_id = %edge.id, "Added {} dependency", level);
        self.events.publish(Event::DependencyAdded(edge.clone()));
        Ok(edge)
    }

    #[instrument(skip(self))]
    pub async fn remove_dependency(&self, level: DependencyLevel, edge_id: &str) -> Result<()> {
        let existing: Option<DependencyEdge> = self.store.find_record(edge_id).await?;
        match existing {
            Some(edge) if edge.level == level => {}
            _ => return Err(CodehiveError::not_found(DependencyEdge::KIND, edge_id)),
        }
        self.store.delete(DependencyEdge::TABLE, edge_id).await?;
        self.events.publish(Event::DependencyRemoved {
            level,
            id: edge_id.to_string(),
        });
        Ok(())
    }

    /// Edges where `id` is either endpoint
    pub async fn list_dependencies(
        &self,
        level: DependencyLevel,
        id: &str,
    ) -> Result<Vec<DependencyEdge>> {
        let mut edges: Vec<DependencyEdge> = self
            .edges(level)
            .await?
            .into_iter()
            .filter(|e| e.from_id == id || e.to_id == id)
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(edges)
    }

    async fn edges(&self, level: DependencyLevel) -> Result<Vec<DependencyEdge>> {
        self.store
            .scan_records(&Filter::all().eq("level", level.as_str()))
            .await
    }

    async fn remove_edges_touching(&self, level: DependencyLevel, id: &str) -> Result<()> {
        for edge in self.list_dependencies(level, id).await? {
            self.store.delete(DependencyEdge::TABLE, &edge.id).await?;
            self.events.publish(Event::DependencyRemoved {
                level,
                id: edge.id,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Statistics, progress, validation
    // ---------------------------------------------------------------------

    pub async fn get_hierarchy_statistics(&self, project_id: &str) -> Result<HierarchyStatistics> {
        let epics = self.list_epics(project_id).await?;
        let subtree = self.load_subtree(epics).await?;

        Ok(HierarchyStatistics {
            project_id: project_id.to_string(),
            epics: LevelCounts::of(subtree.epics.iter().map(|e| &e.status)),
            stories: LevelCounts::of(subtree.stories.iter().map(|s| &s.status)),
            tasks: LevelCounts::of(subtree.tasks.iter().map(|t| &t.status)),
            instructions: LevelCounts::of(subtree.instructions.iter().map(|i| &i.status)),
            total_token_usage: subtree.epics.iter().map(|e| e.token_usage).sum(),
            average_story_points: subtree.average_story_points(),
            average_task_minutes: subtree.average_task_minutes(),
        })
    }

    pub async fn get_epic_statistics(&self, epic_id: &str) -> Result<EpicStatistics> {
        let epic = self.get_epic(epic_id).await?;
        let token_usage = epic.token_usage;
        let subtree = self.load_subtree(vec![epic]).await?;
        let stories = LevelCounts::of(subtree.stories.iter().map(|s| &s.status));

        Ok(EpicStatistics {
            epic_id: epic_id.to_string(),
            stories,
            tasks: LevelCounts::of(subtree.tasks.iter().map(|t| &t.status)),
            instructions: LevelCounts::of(subtree.instructions.iter().map(|i| &i.status)),
            token_usage,
            average_story_points: subtree.average_story_points(),
            average_task_minutes: subtree.average_task_minutes(),
            progress: progress_percent(stories.completed, stories.total),
        })
    }

    /// Nested epic -> stories -> tasks progress tree
    pub async fn get_hierarchy_progress(&self, epic_id: &str) -> Result<HierarchyProgress> {
        let epic = self.get_epic(epic_id).await?;
        let mut stories = Vec::new();

        for story in self.list_stories(epic_id).await? {
            let mut tasks = Vec::new();
            for task in self.list_tasks(&story.id).await? {
                let instructions = self.list_instructions(&task.id).await?;
                let counts = LevelCounts::of(instructions.iter().map(|i| &i.status));
                tasks.push(TaskProgress {
                    id: task.id,
                    title: task.title,
                    status: task.status,
                    total_instructions: counts.total,
                    completed_instructions: counts.completed,
                    progress: progress_percent(counts.completed, counts.total),
                });
            }
            let completed_tasks = tasks.iter().filter(|t| t.status == Status::Completed).count();
            stories.push(StoryProgress {
                id: story.id,
                title: story.title,
                status: story.status,
                total_tasks: tasks.len(),
                completed_tasks,
                progress: progress_percent(completed_tasks, tasks.len()),
                tasks,
            });
        }

        let completed_stories = stories
            .iter()
            .filter(|s| s.status == Status::Completed)
            .count();
        Ok(HierarchyProgress {
            epic_id: epic.id,
            title: epic.title,
            status: epic.status,
            total_stories: stories.len(),
            completed_stories,
            total_tasks: stories.iter().map(|s| s.total_tasks).sum(),
            completed_tasks: stories.iter().map(|s| s.completed_tasks).sum(),
            progress: progress_percent(completed_stories, stories.len()),
            stories,
        })
    }

    /// Structural checks over one epic's subtree
    #[instrument(skip(self))]
    pub async fn validate_hierarchy(&self, epic_id: &str) -> Result<ValidationReport> {
        let epic = self.get_epic(epic_id).await?;
        let project_epics: HashSet<String> = self
            .list_epics(&epic.project_id)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let subtree = self.load_subtree(vec![epic]).await?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for epic in &subtree.epics {
            if epic.title.trim().is_empty() {
                errors.push(format!("Epic {} is missing a title", epic.id));
            }
            if epic.project_id.trim().is_empty() {
                errors.push(format!("Epic {} is missing a project_id", epic.id));
            }
            if subtree.stories.is_empty() {
                warnings.push(format!("Epic {} has no stories", epic.id));
            }
        }

        for story in &subtree.stories {
            if story.title.trim().is_empty() {
                errors.push(format!("Story {} is missing a title", story.id));
            }
            if !subtree.tasks.iter().any(|t| t.story_id == story.id) {
                warnings.push(format!("Story {} has no tasks", story.id));
            }
        }

        for task in &subtree.tasks {
            if task.title.trim().is_empty() {
                errors.push(format!("Task {} is missing a title", task.id));
            }
            if task.task_type.trim().is_empty() {
                errors.push(format!("Task {} is missing a task_type", task.id));
            }

            let mut seen: HashMap<u32, usize> = HashMap::new();
            for instruction in subtree.instructions.iter().filter(|i| i.task_id == task.id) {
                *seen.entry(instruction.sequence).or_default() += 1;
            }
            if seen.is_empty() {
                warnings.push(format!("Task {} has no instructions", task.id));
            }
            let mut duplicates: Vec<u32> = seen
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(seq, _)| seq)
                .collect();
            duplicates.sort_unstable();
            for seq in duplicates {
                errors.push(format!(
                    "Task {} has duplicate instruction sequence {}",
                    task.id, seq
                ));
            }
        }

        for instruction in &subtree.instructions {
            if instruction.directive.trim().is_empty() {
                errors.push(format!("Instruction {} is missing a directive", instruction.id));
            }
            if instruction.expected_outcome.trim().is_empty() {
                errors.push(format!(
                    "Instruction {} is missing an expected_outcome",
                    instruction.id
                ));
            }
        }

        let task_ids: HashSet<String> = subtree.tasks.iter().map(|t| t.id.clone()).collect();
        let instruction_ids: HashSet<String> =
            subtree.instructions.iter().map(|i| i.id.clone()).collect();
        for (level, nodes) in [
            (DependencyLevel::Epic, &project_epics),
            (DependencyLevel::Task, &task_ids),
            (DependencyLevel::Instruction, &instruction_ids),
        ] {
            let edges = self.edges(level).await?;
            let graph = DependencyGraph::from_edges(&edges).restrict_to(nodes);
            if let Some(cycle) = graph.find_cycle() {
                errors.push(format!(
                    "Circular {} dependency: {}",
                    level,
                    cycle.join(" -> ")
                ));
            }
        }

        Ok(ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        })
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn ensure_exists(&self, level: HierarchyLevel, id: &str) -> Result<()> {
        match self.store.get(table_for(level), id).await? {
            Some(_) => Ok(()),
            None => Err(CodehiveError::not_found(level.label(), id)),
        }
    }

    /// Walk up to the owning epic
    async fn epic_id_for(&self, level: HierarchyLevel, id: &str) -> Result<String> {
        match level {
            HierarchyLevel::Epic => Ok(id.to_string()),
            HierarchyLevel::Story => Ok(self.get_story(id).await?.epic_id),
            HierarchyLevel::Task => {
                let task = self.get_task(id).await?;
                Ok(self.get_story(&task.story_id).await?.epic_id)
            }
            HierarchyLevel::Instruction => {
                let instruction = self.get_instruction(id).await?;
                let task = self.get_task(&instruction.task_id).await?;
                Ok(self.get_story(&task.story_id).await?.epic_id)
            }
        }
    }

    async fn load_subtree(&self, epics: Vec<Epic>) -> Result<Subtree> {
        let mut subtree = Subtree::default();
        for epic in &epics {
            subtree.stories.extend(self.list_stories(&epic.id).await?);
        }
        for story in &subtree.stories {
            subtree.tasks.extend(self.list_tasks(&story.id).await?);
        }
        for task in &subtree.tasks {
            subtree
                .instructions
                .extend(self.list_instructions(&task.id).await?);
        }
        subtree.epics = epics;
        Ok(subtree)
    }

    /// Merge a typed partial update, stamping `updated_at` and the lifecycle
    /// timestamps. Callers hold `write_lock`.
    async fn apply_update<R, U>(
        &self,
        id: &str,
        update: &U,
        status: Option<Status>,
        token_usage: Option<u64>,
    ) -> Result<R>
    where
        R: Record,
        U: Serialize + Sync,
    {
        let current = self
            .store
            .get(R::TABLE, id)
            .await?
            .ok_or_else(|| CodehiveError::not_found(R::KIND, id))?;

        if let Some(next) = token_usage {
            let previous = current
                .get("token_usage")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if next < previous {
                return Err(CodehiveError::Validation(format!(
                    "{} {} token_usage cannot decrease ({} -> {})",
                    R::KIND,
                    id,
                    previous,
                    next
                )));
            }
        }

        let now = Utc::now();
        let mut patch = serde_json::to_value(update)?;
        if let Some(object) = patch.as_object_mut() {
            object.insert("updated_at".to_string(), json!(now));
            if status == Some(Status::Completed) {
                object.insert("completed_at".to_string(), json!(now));
            }
        }
        self.store.update(R::TABLE, id, patch).await?;

        if status == Some(Status::InProgress) {
            self.store
                .set_if_null(R::TABLE, id, "started_at", json!(now))
                .await?;
        }

        debug!(kind = R::KIND, id = %id, "Applied update");
        self.store.get_record(id).await
    }
}
