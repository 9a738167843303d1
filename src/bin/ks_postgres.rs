// ABOUTME: PostgreSQL helper binary: one From process per worker, or the To side

use kitchen_sync::helper::{run_helper, ConnectArgs};
use kitchen_sync::postgres::PostgresClient;

fn main() -> anyhow::Result<()> {
    run_helper(|args: &ConnectArgs| {
        Ok(PostgresClient::connect(
            &args.host,
            &args.port,
            &args.database,
            &args.username,
            &args.password,
        )?)
    })
}
