use comfy_table::Table;

use crate::db::get_connection;
use crate::error::{QuillError, Result};
use crate::models::PlanConfig;
use crate::plan;
use crate::settings::get_data_dir;

fn read_config(path: &str) -> Result<PlanConfig> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| QuillError::Other(format!("cannot parse plan config {path}: {e}")))
}

pub fn new(name: &str, institution: Option<&str>, config_path: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let config = read_config(config_path)?;
    let created = plan::create_plan(&conn, name, institution, &config)?;
    println!("Created plan '{}' (id {}), working revision 0", created.name, created.id);
    Ok(())
}

pub fn edit(name: &str, config_path: &str, revision: i64) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let config = read_config(config_path)?;
    let existing = plan::get_plan_by_name(&conn, name)?;
    let new_revision = plan::edit(&conn, existing.id, &config, revision)?;
    println!("Updated working copy of '{name}', revision {new_revision}");
    Ok(())
}

pub fn commit(name: &str, message: &str, revision: i64) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let existing = plan::get_plan_by_name(&conn, name)?;
    let version = plan::commit(&conn, existing.id, message, revision)?;
    println!(
        "Committed version {} of '{name}' (id {}, hash {})",
        version.version_number,
        version.id,
        &version.content_hash[..12.min(version.content_hash.len())],
    );
    Ok(())
}

pub fn fork(version_id: i64, name: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let forked = plan::fork(&conn, version_id, name)?;
    println!("Forked version {version_id} into plan '{}' (id {})", forked.name, forked.id);
    Ok(())
}

pub fn log(name: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let existing = plan::get_plan_by_name(&conn, name)?;
    println!(
        "Plan '{}': working revision {}, head version {}",
        existing.name,
        existing.working_revision,
        existing
            .head_version_id
            .map(|v| v.to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    );
    if let Some(origin) = existing.forked_from_version_id {
        println!("Forked from version {origin}");
    }

    let mut table = Table::new();
    table.set_header(vec!["Version", "ID", "Parent", "Hash", "Message", "Created"]);
    for version in plan::versions(&conn, existing.id)? {
        table.add_row(vec![
            version.version_number.to_string(),
            version.id.to_string(),
            version
                .parent_version_id
                .map(|p| p.to_string())
                .unwrap_or_default(),
            version.content_hash[..12.min(version.content_hash.len())].to_string(),
            version.commit_message,
            version.created_at,
        ]);
    }
    println!("{table}");
    Ok(())
}
