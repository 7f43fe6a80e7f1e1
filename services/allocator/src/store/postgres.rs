//! Postgres storage backend.
//!
//! Every conditional transition is a single statement so the database
//! arbitrates concurrent writers: the reservation compare-and-swap is one
//! `UPDATE ... WHERE reservation_holder IS NULL`, and the one-allocation-per-node
//! rule is backed by a partial unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metalloc_events::{AllocationState, ProvisionState};
use metalloc_id::{AllocationId, Identity, NodeId};
use sqlx::{
    postgres::{PgPool, PgRow},
    Postgres, QueryBuilder, Row,
};
use uuid::Uuid;

use super::{AllocationStore, NodeInventory, ReleaseOutcome, StoreError};
use crate::model::{
    Allocation, AllocationFilter, FinishMatch, MatchOutcome, NewAllocation, NewNode, Node,
    SortDir, SortKey,
};

const ALLOCATION_COLUMNS: &str = "id, uuid, name, state, node_id, resource_class, traits, \
     candidate_nodes, extra, last_error, created_at, updated_at";

const NODE_COLUMNS: &str =
    "id, uuid, name, resource_class, traits, maintenance, provision_state, reservation_holder, task_lock";

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug)]
struct AllocationRow {
    id: i64,
    uuid: Uuid,
    name: Option<String>,
    state: String,
    node_id: Option<i64>,
    resource_class: String,
    traits: Vec<String>,
    candidate_nodes: Vec<Uuid>,
    extra: serde_json::Value,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            state: row.try_get("state")?,
            node_id: row.try_get("node_id")?,
            resource_class: row.try_get("resource_class")?,
            traits: row.try_get("traits")?,
            candidate_nodes: row.try_get("candidate_nodes")?,
            extra: row.try_get("extra")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = StoreError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        let state: AllocationState = row.state.parse().map_err(|e| StoreError::Corrupt {
            entity: "allocation",
            message: format!("{e}"),
        })?;
        let extra = match row.extra {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(StoreError::Corrupt {
                    entity: "allocation",
                    message: format!("extra is not an object: {other}"),
                })
            }
        };

        Ok(Allocation {
            id: AllocationId::new(row.id),
            uuid: row.uuid,
            name: row.name,
            state,
            node_id: row.node_id.map(NodeId::new),
            resource_class: row.resource_class,
            traits: row.traits,
            candidate_nodes: row.candidate_nodes,
            extra,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct NodeRow {
    id: i64,
    uuid: Uuid,
    name: Option<String>,
    resource_class: String,
    traits: Vec<String>,
    maintenance: bool,
    provision_state: String,
    reservation_holder: Option<Uuid>,
    task_lock: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            resource_class: row.try_get("resource_class")?,
            traits: row.try_get("traits")?,
            maintenance: row.try_get("maintenance")?,
            provision_state: row.try_get("provision_state")?,
            reservation_holder: row.try_get("reservation_holder")?,
            task_lock: row.try_get("task_lock")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let provision_state: ProvisionState =
            row.provision_state.parse().map_err(|e| StoreError::Corrupt {
                entity: "node",
                message: format!("{e}"),
            })?;

        Ok(Node {
            id: NodeId::new(row.id),
            uuid: row.uuid,
            name: row.name,
            resource_class: row.resource_class,
            traits: row.traits.into_iter().collect(),
            maintenance: row.maintenance,
            provision_state,
            reservation_holder: row.reservation_holder,
            task_lock: row.task_lock,
        })
    }
}

fn allocations(rows: Vec<AllocationRow>) -> Result<Vec<Allocation>, StoreError> {
    rows.into_iter().map(Allocation::try_from).collect()
}

fn nodes(rows: Vec<NodeRow>) -> Result<Vec<Node>, StoreError> {
    rows.into_iter().map(Node::try_from).collect()
}

/// Maps unique violations onto `Duplicate`, naming the field from the
/// violated constraint.
fn map_write_error(
    entity: &'static str,
    value: impl Fn(&str) -> String,
    e: sqlx::Error,
) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            let field = match db_err.constraint() {
                Some(c) if c.ends_with("_uuid_key") => "uuid",
                Some(c) if c.ends_with("_name_key") => "name",
                Some(c) if c.ends_with("_node_id_key") => "node_id",
                _ => "key",
            };
            return StoreError::Duplicate {
                entity,
                field,
                value: value(field),
            };
        }
    }
    StoreError::Query(e)
}

// =============================================================================
// Allocations
// =============================================================================

/// Allocation records in Postgres.
#[derive(Clone)]
pub struct PgAllocationStore {
    pool: PgPool,
}

impl PgAllocationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where<T>(
        &self,
        column: &str,
        value: T,
    ) -> Result<Option<Allocation>, StoreError>
    where
        T: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE {column} = $1");
        let row = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        row.map(Allocation::try_from).transpose()
    }
}

#[async_trait]
impl AllocationStore for PgAllocationStore {
    async fn create(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO allocations (uuid, name, state, resource_class, traits, candidate_nodes, extra)
            VALUES ($1, $2, 'allocating', $3, $4, $5, $6)
            RETURNING {ALLOCATION_COLUMNS}
            "#
        );
        let uuid = new.uuid;
        let name = new.name.clone();
        let row = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(new.uuid)
            .bind(&new.name)
            .bind(&new.resource_class)
            .bind(&new.traits)
            .bind(&new.candidate_nodes)
            .bind(serde_json::Value::Object(new.extra))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(
                    "allocation",
                    |field| match field {
                        "name" => name.clone().unwrap_or_default(),
                        _ => uuid.to_string(),
                    },
                    e,
                )
            })?;
        row.try_into()
    }

    async fn get_by_id(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        self.fetch_one_where("id", id.value()).await
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Allocation>, StoreError> {
        self.fetch_one_where("uuid", uuid).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Allocation>, StoreError> {
        self.fetch_one_where("name", name.to_string()).await
    }

    async fn get_by_node(&self, node_id: NodeId) -> Result<Option<Allocation>, StoreError> {
        self.fetch_one_where("node_id", node_id.value()).await
    }

    async fn list(&self, filter: &AllocationFilter) -> Result<Vec<Allocation>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE TRUE"));

        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(node_id) = filter.node_id {
            qb.push(" AND node_id = ").push_bind(node_id.value());
        }
        if let Some(rc) = &filter.resource_class {
            qb.push(" AND resource_class = ").push_bind(rc.clone());
        }

        let column = match filter.sort_key {
            SortKey::Id => "id",
            SortKey::Uuid => "uuid",
            SortKey::Name => "name",
        };
        // NULL names sort first ascending, matching the memory backend.
        let (dir, nulls) = match filter.sort_dir {
            SortDir::Asc => ("ASC", "NULLS FIRST"),
            SortDir::Desc => ("DESC", "NULLS LAST"),
        };
        qb.push(format!(" ORDER BY {column} {dir} {nulls}, id {dir}"));

        let rows = qb
            .build_query_as::<AllocationRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        allocations(rows)
    }

    async fn finish_match(
        &self,
        id: AllocationId,
        outcome: &MatchOutcome,
    ) -> Result<FinishMatch, StoreError> {
        let (state, node_id, last_error) = match outcome {
            MatchOutcome::Reserved(node_id) => {
                (AllocationState::Active, Some(node_id.value()), None)
            }
            MatchOutcome::Failed(reason) => (AllocationState::Error, None, Some(reason.clone())),
        };

        let sql = format!(
            r#"
            UPDATE allocations
            SET state = $2, node_id = $3, last_error = $4, updated_at = now()
            WHERE id = $1 AND state = 'allocating'
            RETURNING {ALLOCATION_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(id.value())
            .bind(state.as_str())
            .bind(node_id)
            .bind(last_error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(
                    "allocation",
                    |_| node_id.map(|n| n.to_string()).unwrap_or_default(),
                    e,
                )
            })?;

        if let Some(row) = updated {
            return Ok(FinishMatch::Applied(row.try_into()?));
        }
        Ok(match self.get_by_id(id).await? {
            Some(current) => FinishMatch::Stale(current),
            None => FinishMatch::Missing,
        })
    }

    async fn destroy(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        let sql = format!("DELETE FROM allocations WHERE id = $1 RETURNING {ALLOCATION_COLUMNS}");
        let row = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        row.map(Allocation::try_from).transpose()
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Node inventory in Postgres.
#[derive(Clone)]
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeInventory for PgInventory {
    async fn enroll_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let uuid = node.uuid.unwrap_or_else(Uuid::new_v4);
        let name = node.name.clone();
        let traits: Vec<String> = node.traits.into_iter().collect();
        let sql = format!(
            r#"
            INSERT INTO nodes (uuid, name, resource_class, traits, maintenance, provision_state, task_lock)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {NODE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(uuid)
            .bind(&node.name)
            .bind(&node.resource_class)
            .bind(&traits)
            .bind(node.maintenance)
            .bind(node.provision_state.as_str())
            .bind(&node.task_lock)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(
                    "node",
                    |field| match field {
                        "name" => name.clone().unwrap_or_default(),
                        _ => uuid.to_string(),
                    },
                    e,
                )
            })?;
        row.try_into()
    }

    async fn lookup_node(&self, identity: &Identity) -> Result<Option<Node>, StoreError> {
        let row = match identity {
            Identity::Uuid(uuid) => {
                let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE uuid = $1");
                sqlx::query_as::<_, NodeRow>(&sql)
                    .bind(*uuid)
                    .fetch_optional(&self.pool)
                    .await
            }
            Identity::Name(name) => {
                let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE name = $1");
                sqlx::query_as::<_, NodeRow>(&sql)
                    .bind(name.as_str())
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(StoreError::Query)?;
        row.map(Node::try_from).transpose()
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1");
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        row.map(Node::try_from).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id");
        let rows = sqlx::query_as::<_, NodeRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        nodes(rows)
    }

    async fn list_nodes_by_class(&self, resource_class: &str) -> Result<Vec<Node>, StoreError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE resource_class = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(resource_class)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        nodes(rows)
    }

    async fn try_reserve(&self, id: NodeId, holder: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET reservation_holder = $2
            WHERE id = $1
              AND reservation_holder IS NULL
              AND task_lock IS NULL
              AND NOT maintenance
              AND provision_state = 'available'
            "#,
        )
        .bind(id.value())
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: NodeId, holder: Uuid) -> Result<ReleaseOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET reservation_holder = NULL
            WHERE id = $1 AND reservation_holder = $2 AND task_lock IS NULL
            "#,
        )
        .bind(id.value())
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 1 {
            return Ok(ReleaseOutcome::Released);
        }

        // Nothing changed; work out why.
        let Some(node) = self.get_node(id).await? else {
            return Ok(ReleaseOutcome::NodeMissing);
        };
        match (node.reservation_holder, node.task_lock) {
            (Some(current), _) if current != holder => Ok(ReleaseOutcome::HeldByOther(current)),
            (Some(_), Some(lock)) => Err(StoreError::NodeLocked {
                node: node.uuid,
                lock,
            }),
            _ => Ok(ReleaseOutcome::NotReserved),
        }
    }

    async fn release_held_by(&self, holder: Uuid) -> Result<Vec<NodeId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE nodes SET reservation_holder = NULL WHERE reservation_holder = $1 RETURNING id",
        )
        .bind(holder)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(ids.into_iter().map(NodeId::new).collect())
    }

    async fn set_task_lock(&self, id: NodeId, lock: Option<String>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE nodes SET task_lock = $2 WHERE id = $1")
            .bind(id.value())
            .bind(lock)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "node",
                identity: id.to_string(),
            });
        }
        Ok(())
    }
}
