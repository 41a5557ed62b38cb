use comfy_table::Table;

use crate::db::get_connection;
use crate::error::Result;
use crate::settings::get_data_dir;

pub fn add(name: &str, institution: Option<&str>, currency: &str) -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    conn.execute(
        "INSERT INTO accounts (name, institution, currency) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, institution, currency],
    )?;
    println!("Added account '{name}'");
    Ok(())
}

pub fn list() -> Result<()> {
    let conn = get_connection(&get_data_dir().join("quill.db"))?;
    let mut stmt =
        conn.prepare("SELECT id, name, institution, currency FROM accounts ORDER BY name")?;
    let rows: Vec<(i64, String, Option<String>, String)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Institution", "Currency"]);
    for (id, name, institution, currency) in rows {
        table.add_row(vec![
            id.to_string(),
            name,
            institution.unwrap_or_default(),
            currency,
        ]);
    }
    println!("{table}");
    Ok(())
}
