//! Persistence for TDD cycles and the tests, artifacts and queries they own

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use codehive_core::{Artifact, CodehiveError, Cycle, Phase, Query, Result, TestCase};

use crate::record::{Filter, Record, RecordStore, RecordStoreExt};

impl Record for Cycle {
    const TABLE: &'static str = "cycles";
    const KIND: &'static str = "Cycle";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for TestCase {
    const TABLE: &'static str = "cycle_tests";
    const KIND: &'static str = "Test";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Artifact {
    const TABLE: &'static str = "cycle_artifacts";
    const KIND: &'static str = "Artifact";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Query {
    const TABLE: &'static str = "cycle_queries";
    const KIND: &'static str = "Query";

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// A cycle together with everything linked to it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleDetails {
    pub cycle: Cycle,
    pub tests: Vec<TestCase>,
    pub artifacts: Vec<Artifact>,
    pub queries: Vec<Query>,
}

#[derive(Clone)]
pub struct CycleStore {
    store: Arc<dyn RecordStore>,
}

impl CycleStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn save_cycle(&self, cycle: &Cycle) -> Result<()> {
        self.store.put_record(cycle).await
    }

    pub async fn get_cycle(&self, id: &str) -> Result<Cycle> {
        self.find_cycle(id)
            .await?
            .ok_or_else(|| CodehiveError::not_found(Cycle::KIND, id))
    }

    /// Fails with `UnknownPhase` when the stored phase is not one of the four phases
    pub async fn find_cycle(&self, id: &str) -> Result<Option<Cycle>> {
        let Some(doc) = self.store.get(Cycle::TABLE, id).await? else {
            return Ok(None);
        };
        if let Some(phase) = doc.get("phase").and_then(Value::as_str) {
            phase.parse::<Phase>()?;
        }
        Ok(Some(serde_json::from_value(doc)?))
    }

    pub async fn list_cycles(&self, project_id: Option<&str>) -> Result<Vec<Cycle>> {
        let filter = match project_id {
            Some(project_id) => Filter::all().eq("project_id", project_id),
            None => Filter::all(),
        };
        let mut cycles: Vec<Cycle> = self.store.scan_records(&filter).await?;
        cycles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cycles)
    }

    /// Remove a cycle along with its tests, artifacts and queries
    pub async fn delete_cycle(&self, id: &str) -> Result<bool> {
        let by_cycle = Filter::all().eq("cycle_id", id);
        let tests: Vec<TestCase> = self.store.scan_records(&by_cycle).await?;
        for test in tests {
            self.store.delete(TestCase::TABLE, &test.id).await?;
        }
        let artifacts: Vec<Artifact> = self.store.scan_records(&by_cycle).await?;
        for artifact in artifacts {
            self.store.delete(Artifact::TABLE, &artifact.id).await?;
        }
        let queries: Vec<Query> = self.store.scan_records(&by_cycle).await?;
        for query in queries {
            self.store.delete(Query::TABLE, &query.id).await?;
        }
        let removed = self.store.delete(Cycle::TABLE, id).await?;
        debug!(cycle_id = %id, removed, "Deleted cycle");
        Ok(removed)
    }

    pub async fn save_test(&self, test: &TestCase) -> Result<()> {
        self.store.put_record(test).await
    }

    pub async fn get_test(&self, id: &str) -> Result<TestCase> {
        self.store.get_record(id).await
    }

    pub async fn list_tests(&self, cycle_id: &str) -> Result<Vec<TestCase>> {
        let mut tests: Vec<TestCase> = self
            .store
            .scan_records(&Filter::all().eq("cycle_id", cycle_id))
            .await?;
        tests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tests)
    }

    pub async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.store.put_record(artifact).await
    }

    pub async fn list_artifacts(&self, cycle_id: &str) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .store
            .scan_records(&Filter::all().eq("cycle_id", cycle_id))
            .await?;
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(artifacts)
    }

    pub async fn save_query(&self, query: &Query) -> Result<()> {
        self.store.put_record(query).await
    }

    pub async fn get_query(&self, id: &str) -> Result<Query> {
        self.store.get_record(id).await
    }

    pub async fn list_queries(&self, cycle_id: &str) -> Result<Vec<Query>> {
        let mut queries: Vec<Query> = self
            .store
            .scan_records(&Filter::all().eq("cycle_id", cycle_id))
            .await?;
        queries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(queries)
    }

    /// Pending queries with BLOCKING urgency
    pub async fn blocking_queries(&self, cycle_id: &str) -> Result<Vec<Query>> {
        Ok(self
            .list_queries(cycle_id)
            .await?
            .into_iter()
            .filter(Query::is_blocking)
            .collect())
    }

    pub async fn details(&self, cycle_id: &str) -> Result<CycleDetails> {
        Ok(CycleDetails {
            cycle: self.get_cycle(cycle_id).await?,
            tests: self.list_tests(cycle_id).await?,
            artifacts: self.list_artifacts(cycle_id).await?,
            queries: self.list_queries(cycle_id).await?,
        })
    }
}
