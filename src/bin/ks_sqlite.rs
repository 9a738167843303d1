// ABOUTME: SQLite helper binary: one From process per worker, or the To side
// ABOUTME: The database field of an sqlite:// URL is a filesystem path

use kitchen_sync::helper::{run_helper, ConnectArgs};
use kitchen_sync::sqlite::SqliteClient;

fn main() -> anyhow::Result<()> {
    run_helper(|args: &ConnectArgs| Ok(SqliteClient::connect(&args.database)?))
}
