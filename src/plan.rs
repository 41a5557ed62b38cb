use rusqlite::{Connection, OptionalExtension};

use crate::error::{QuillError, Result};
use crate::models::PlanConfig;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct ParsePlan {
    pub id: i64,
    pub name: String,
    pub institution: Option<String>,
    pub working: PlanConfig,
    pub working_revision: i64,
    pub head_version_id: Option<i64>,
    pub forked_from_version_id: Option<i64>,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct PlanVersion {
    pub id: i64,
    pub plan_id: i64,
    pub parent_version_id: Option<i64>,
    pub version_number: i64,
    pub config: PlanConfig,
    pub content_hash: String,
    pub commit_message: String,
    pub created_at: String,
}

/// What a parse run executes against. The draft/committed distinction is a
/// type, not an optional version field: a draft can never be mistaken for a
/// committed version at a call site.
#[derive(Debug, Clone)]
pub enum PlanSource {
    Draft(ParsePlan),
    Committed(PlanVersion),
}

impl PlanSource {
    pub fn config(&self) -> &PlanConfig {
        match self {
            PlanSource::Draft(p) => &p.working,
            PlanSource::Committed(v) => &v.config,
        }
    }

    pub fn plan_id(&self) -> i64 {
        match self {
            PlanSource::Draft(p) => p.id,
            PlanSource::Committed(v) => v.plan_id,
        }
    }

    pub fn version_id(&self) -> Option<i64> {
        match self {
            PlanSource::Draft(_) => None,
            PlanSource::Committed(v) => Some(v.id),
        }
    }
}

fn config_hash(config: &PlanConfig) -> Result<String> {
    let canonical = serde_json::to_vec(config)
        .map_err(|e| QuillError::Other(format!("cannot serialize plan config: {e}")))?;
    Ok(crate::blobstore::checksum(&canonical))
}

fn parse_config(raw: &str) -> Result<PlanConfig> {
    serde_json::from_str(raw).map_err(|e| QuillError::Other(format!("corrupt plan config: {e}")))
}

// ---------------------------------------------------------------------------
// Plan CRUD
// ---------------------------------------------------------------------------

pub fn create_plan(
    conn: &Connection,
    name: &str,
    institution: Option<&str>,
    config: &PlanConfig,
) -> Result<ParsePlan> {
    let raw = serde_json::to_string(config)
        .map_err(|e| QuillError::Other(format!("cannot serialize plan config: {e}")))?;
    conn.execute(
        "INSERT INTO parse_plans (name, institution, working_config) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, institution, raw],
    )?;
    get_plan(conn, conn.last_insert_rowid())
}

pub fn get_plan(conn: &Connection, plan_id: i64) -> Result<ParsePlan> {
    let row = conn
        .query_row(
            "SELECT id, name, institution, working_config, working_revision, head_version_id, \
             forked_from_version_id FROM parse_plans WHERE id = ?1",
            [plan_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            },
        )
        .map_err(|_| QuillError::UnknownPlan(plan_id.to_string()))?;
    Ok(ParsePlan {
        id: row.0,
        name: row.1,
        institution: row.2,
        working: parse_config(&row.3)?,
        working_revision: row.4,
        head_version_id: row.5,
        forked_from_version_id: row.6,
    })
}

pub fn get_plan_by_name(conn: &Connection, name: &str) -> Result<ParsePlan> {
    let id: i64 = conn
        .query_row("SELECT id FROM parse_plans WHERE name = ?1", [name], |row| row.get(0))
        .map_err(|_| QuillError::UnknownPlan(name.to_string()))?;
    get_plan(conn, id)
}

/// Replace the working copy. Only the draft is touched; no version is
/// assigned. Fails when the caller's view of the working copy is stale.
pub fn edit(
    conn: &Connection,
    plan_id: i64,
    config: &PlanConfig,
    expected_revision: i64,
) -> Result<i64> {
    let raw = serde_json::to_string(config)
        .map_err(|e| QuillError::Other(format!("cannot serialize plan config: {e}")))?;
    let changed = conn.execute(
        "UPDATE parse_plans SET working_config = ?1, working_revision = working_revision + 1 \
         WHERE id = ?2 AND working_revision = ?3",
        rusqlite::params![raw, plan_id, expected_revision],
    )?;
    if changed == 0 {
        // Distinguish a missing plan from a stale revision.
        get_plan(conn, plan_id)?;
        return Err(QuillError::ConcurrentEdit(plan_id));
    }
    Ok(expected_revision + 1)
}

/// Snapshot the working copy into a new immutable version whose parent is
/// the current head, and advance the head pointer. The whole operation is
/// one transaction; a stale working-copy revision aborts it.
pub fn commit(
    conn: &Connection,
    plan_id: i64,
    message: &str,
    expected_revision: i64,
) -> Result<PlanVersion> {
    let tx = conn.unchecked_transaction()?;
    let plan = get_plan(&tx, plan_id)?;
    if plan.working_revision != expected_revision {
        return Err(QuillError::ConcurrentEdit(plan_id));
    }

    let (parent_id, next_number) = match plan.head_version_id {
        Some(head) => {
            let head_number: i64 = tx.query_row(
                "SELECT version_number FROM plan_versions WHERE id = ?1",
                [head],
                |row| row.get(0),
            )?;
            (Some(head), head_number + 1)
        }
        None => (None, 0),
    };

    let raw = serde_json::to_string(&plan.working)
        .map_err(|e| QuillError::Other(format!("cannot serialize plan config: {e}")))?;
    let hash = config_hash(&plan.working)?;
    tx.execute(
        "INSERT INTO plan_versions (plan_id, parent_version_id, version_number, config, \
         content_hash, commit_message) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![plan_id, parent_id, next_number, raw, hash, message],
    )?;
    let version_id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE parse_plans SET head_version_id = ?1 WHERE id = ?2",
        rusqlite::params![version_id, plan_id],
    )?;
    tx.commit()?;
    get_version(conn, version_id)
}

/// Create a new plan seeded from a committed version. The fork's version-0
/// snapshot equals the fork point; the only remaining link to the original
/// lineage is the forked_from pointer.
pub fn fork(conn: &Connection, version_id: i64, new_name: &str) -> Result<ParsePlan> {
    let origin = get_version(conn, version_id)?;
    let tx = conn.unchecked_transaction()?;
    let raw = serde_json::to_string(&origin.config)
        .map_err(|e| QuillError::Other(format!("cannot serialize plan config: {e}")))?;
    tx.execute(
        "INSERT INTO parse_plans (name, institution, working_config, forked_from_version_id) \
         SELECT ?1, institution, ?2, ?3 FROM parse_plans WHERE id = ?4",
        rusqlite::params![new_name, raw, version_id, origin.plan_id],
    )?;
    let new_plan_id = tx.last_insert_rowid();
    let hash = config_hash(&origin.config)?;
    tx.execute(
        "INSERT INTO plan_versions (plan_id, parent_version_id, version_number, config, \
         content_hash, commit_message) VALUES (?1, NULL, 0, ?2, ?3, ?4)",
        rusqlite::params![
            new_plan_id,
            raw,
            hash,
            format!("Forked from version {}", origin.id),
        ],
    )?;
    let v0 = tx.last_insert_rowid();
    tx.execute(
        "UPDATE parse_plans SET head_version_id = ?1 WHERE id = ?2",
        rusqlite::params![v0, new_plan_id],
    )?;
    tx.commit()?;
    get_plan(conn, new_plan_id)
}

// ---------------------------------------------------------------------------
// Version queries
// ---------------------------------------------------------------------------

pub fn get_version(conn: &Connection, version_id: i64) -> Result<PlanVersion> {
    let row = conn
        .query_row(
            "SELECT id, plan_id, parent_version_id, version_number, config, content_hash, \
             commit_message, created_at FROM plan_versions WHERE id = ?1",
            [version_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?
        .ok_or(QuillError::UnknownVersion(version_id))?;
    Ok(PlanVersion {
        id: row.0,
        plan_id: row.1,
        parent_version_id: row.2,
        version_number: row.3,
        config: parse_config(&row.4)?,
        content_hash: row.5,
        commit_message: row.6,
        created_at: row.7,
    })
}

pub fn versions(conn: &Connection, plan_id: i64) -> Result<Vec<PlanVersion>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM plan_versions WHERE plan_id = ?1 ORDER BY version_number",
    )?;
    let ids: Vec<i64> = stmt
        .query_map([plan_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.into_iter().map(|id| get_version(conn, id)).collect()
}

/// Re-hash a committed version's stored config against its recorded content
/// hash. Committed versions are immutable; any drift is a violation.
pub fn verify_version(conn: &Connection, version_id: i64) -> Result<()> {
    let version = get_version(conn, version_id)?;
    let actual = config_hash(&version.config)?;
    if actual != version.content_hash {
        return Err(QuillError::ImmutabilityViolation(version_id));
    }
    Ok(())
}
