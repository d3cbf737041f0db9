use rowstore::database::{Database, DatabaseOptions};
use rowstore::tuple::{DataType, Value};
use tracing_subscriber::EnvFilter;

fn main() -> rowstore::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Rowstore - row cache and durability log demo");
    println!("============================================\n");

    let dir = std::env::temp_dir().join("rowstore-demo");
    let base = dir.join("demo");
    let db = Database::open(&base, DatabaseOptions::new().cache_scale(8))?;
    println!("Opened database at: {}", base.display());

    let session = db.open_session()?;
    let table = match db.table_id("greetings")? {
        Some(table) => table,
        None => db.create_table(session, "greetings", vec![DataType::Integer, DataType::VarChar(64)], 1)?,
    };

    let messages = ["Hello, World!", "Rows live in the .data file", "Changes go to the .log first"];
    let start = db.table_rows(table)?.len() as i32;
    for (i, text) in messages.iter().enumerate() {
        let pos = db.insert(session, table, vec![Value::Integer(start + i as i32), Value::String(text.to_string())])?;
        println!("Inserted row at {}", pos);
    }
    db.commit(session)?;

    println!("\nTable rows:");
    for pos in db.table_rows(table)? {
        if let Some(values) = db.fetch(table, pos)? {
            println!("  - {}: {:?}", pos, values);
        }
    }

    let stats = db.stats();
    println!("\nStats:");
    println!("  - Resident rows: {}", stats.resident_rows);
    println!("  - Log records: {}", stats.log_records);
    println!("  - Mutations: {}", stats.mutation_count);

    db.checkpoint(false)?;
    db.close()?;
    println!("\nCheckpointed and closed; run again to see the rows recovered.");
    Ok(())
}
