use dealflow_db::migrations;

use crate::commands::{with_database, CommandResult};

pub fn run() -> CommandResult {
    let result = with_database("migrate", |_config, pool| async move {
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))
    });

    match result {
        Ok(versions) => CommandResult::success(
            "migrate",
            format!("applied pending migrations ({} total)", versions.len()),
        ),
        Err(failure) => failure,
    }
}
