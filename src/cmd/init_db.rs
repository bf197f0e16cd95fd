//! Database bootstrap command - `webs init-db`.

use anyhow::Result;

pub fn cmd_init_db(db_path: &std::path::Path) -> Result<()> {
    webs::app::server::open_database(db_path)?;
    println!("Webs database initialized at {}", db_path.display());
    Ok(())
}
