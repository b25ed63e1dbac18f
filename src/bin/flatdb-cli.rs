use std::error::Error;
use std::io::{self, Write};

use clap::Parser;

use flatdb::{ColumnDefinition, DataType, FlatDb, RowData, Table};

#[derive(Parser)]
#[command(name = "flatdb", about = "Interactive shell over a flatdb data directory")]
struct Args {
    /// Root data directory of the engine
    #[arg(long, default_value = "./flatdb-data")]
    data_dir: String,

    /// Database to select on startup
    #[arg(long)]
    database: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let db = FlatDb::new(&args.data_dir)?;
    if let Some(database) = &args.database {
        db.schema_manager()
            .lock()
            .unwrap()
            .set_current_database_id(database)?;
    }

    println!("flatdb shell");
    println!("Type 'help' for commands, 'quit' to exit");
    println!();

    loop {
        print!("flatdb> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        match input {
            "quit" | "exit" => break,
            "help" => {
                show_help();
                continue;
            }
            "" => continue,
            _ => {}
        }

        match execute(&db, input) {
            Ok(output) => println!("{output}"),
            Err(e) => println!("Error: {e}"),
        }
    }
    Ok(())
}

fn show_help() {
    println!("Commands:");
    println!("  schemas                              list databases");
    println!("  use <database>                       switch database");
    println!("  createdb <database>                  create a database");
    println!("  dropdb <database>                    remove a database");
    println!("  tables                               list tables of the current database");
    println!("  create <table> <col:type[:pk]>...    create a table");
    println!("  describe <table>                     show a table's columns");
    println!("  drop <table>                         drop a table");
    println!("  insert <table> <value>...            insert a row (values in column order)");
    println!("  get <table> <row-id>                 print one row");
    println!("  delete <table> <row-id>              delete one row");
    println!("  scan <table>                         print every live row");
    println!("  count <table>                        print the row count");
    println!("  quit                                 exit");
}

fn execute(db: &FlatDb, input: &str) -> Result<String, Box<dyn Error>> {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("");
    let rest: Vec<&str> = parts.collect();

    match command {
        "schemas" => {
            let listed = db.schema_manager().lock().unwrap().list_schemas()?;
            Ok(listed.join("\n"))
        }
        "use" => {
            let id = expect_arg(&rest, 0, "database")?;
            db.schema_manager()
                .lock()
                .unwrap()
                .set_current_database_id(id)?;
            Ok(format!("using '{id}'"))
        }
        "createdb" => {
            let id = expect_arg(&rest, 0, "database")?;
            db.schema_manager().lock().unwrap().create_schema(id)?;
            Ok(format!("created database '{id}'"))
        }
        "dropdb" => {
            let id = expect_arg(&rest, 0, "database")?;
            db.schema_manager().lock().unwrap().remove_schema(id)?;
            Ok(format!("removed database '{id}'"))
        }
        "tables" => {
            let manager = db.schema_manager();
            let mut manager = manager.lock().unwrap();
            let schema = manager.get_schema(None)?;
            let names = schema.lock().unwrap().table_names();
            Ok(names.join("\n"))
        }
        "create" => {
            let table = expect_arg(&rest, 0, "table")?;
            if rest.len() < 2 {
                return Err("at least one column definition required".into());
            }
            let columns = rest[1..]
                .iter()
                .map(|spec| parse_column(spec))
                .collect::<Result<Vec<_>, _>>()?;
            db.create_table(table, &columns)?;
            Ok(format!("created table '{table}'"))
        }
        "describe" => {
            let table = open_table(db, &rest)?;
            let schema = table.table_schema();
            let schema = schema.lock().unwrap();
            let mut out = String::new();
            for (id, column) in schema.columns().iter().enumerate() {
                let pk = if column.is_primary_key() { " PRIMARY KEY" } else { "" };
                out.push_str(&format!("{id}: {} {:?}{pk}\n", column.name, column.data_type));
            }
            Ok(out.trim_end().to_string())
        }
        "drop" => {
            let table = expect_arg(&rest, 0, "table")?;
            db.schema_manager().lock().unwrap().drop_table(table, None)?;
            Ok(format!("dropped table '{table}'"))
        }
        "insert" => {
            let mut table = open_table(db, &rest)?;
            let strings: std::collections::HashMap<_, _> = rest[1..]
                .iter()
                .enumerate()
                .map(|(id, value)| (id, Some(value.to_string())))
                .collect();
            let row = table.convert_string_row_to_data_row(&strings)?;
            let row: RowData = row
                .into_iter()
                .filter_map(|(id, v)| v.map(|v| (id, v)))
                .collect();
            let row_id = table.add_row_data(&row)?;
            Ok(format!("inserted row {row_id}"))
        }
        "get" => {
            let mut table = open_table(db, &rest)?;
            let row_id = expect_arg(&rest, 1, "row-id")?.parse()?;
            Ok(render_row(&mut table, row_id)?)
        }
        "delete" => {
            let mut table = open_table(db, &rest)?;
            let row_id = expect_arg(&rest, 1, "row-id")?.parse()?;
            table.remove_row(row_id)?;
            Ok(format!("deleted row {row_id}"))
        }
        "scan" => {
            let mut table = open_table(db, &rest)?;
            let mut out = String::new();
            table.rewind()?;
            while table.is_valid() {
                let row_id = table.tell().unwrap();
                out.push_str(&render_row(&mut table, row_id)?);
                out.push('\n');
                table.advance()?;
            }
            Ok(out.trim_end().to_string())
        }
        "count" => {
            let mut table = open_table(db, &rest)?;
            Ok(table.row_count()?.to_string())
        }
        other => Err(format!("unknown command '{other}' (try 'help')").into()),
    }
}

fn expect_arg<'a>(rest: &[&'a str], pos: usize, what: &str) -> Result<&'a str, Box<dyn Error>> {
    rest.get(pos)
        .copied()
        .ok_or_else(|| format!("missing argument: {what}").into())
}

fn open_table(db: &FlatDb, rest: &[&str]) -> Result<Table, Box<dyn Error>> {
    Ok(db.open_table(expect_arg(rest, 0, "table")?)?)
}

/// `name:type`, `name:type:pk` or `name:varchar(32)` style column specs.
fn parse_column(spec: &str) -> Result<ColumnDefinition, Box<dyn Error>> {
    let mut parts = spec.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or("empty column name")?;
    let type_spec = parts.next().ok_or("missing column type")?;

    let (type_name, length) = match type_spec.split_once('(') {
        Some((type_name, tail)) => {
            let length = tail
                .strip_suffix(')')
                .ok_or("unbalanced parenthesis in type")?
                .parse::<u32>()?;
            (type_name, Some(length))
        }
        None => (type_spec, None),
    };

    let data_type = match type_name.to_ascii_lowercase().as_str() {
        "bool" => DataType::Bool,
        "tinyint" => DataType::TinyInt,
        "smallint" => DataType::SmallInt,
        "int" => DataType::Int,
        "bigint" => DataType::BigInt,
        "float" => DataType::Float,
        "double" => DataType::Double,
        "decimal" => DataType::Decimal,
        "year" => DataType::Year,
        "date" => DataType::Date,
        "time" => DataType::Time,
        "datetime" => DataType::DateTime,
        "timestamp" => DataType::Timestamp,
        "char" => DataType::Char,
        "varchar" => DataType::Varchar,
        "text" => DataType::Text,
        "blob" => DataType::Blob,
        other => return Err(format!("unknown type '{other}'").into()),
    };

    let mut definition = ColumnDefinition::new(name, data_type);
    if let Some(length) = length {
        definition = definition.with_length(length);
    }
    for modifier in parts {
        match modifier {
            "pk" => definition = definition.primary_key(),
            "ai" => definition = definition.auto_increment(),
            other => return Err(format!("unknown column modifier '{other}'").into()),
        }
    }
    Ok(definition)
}

fn render_row(table: &mut Table, row_id: u64) -> Result<String, Box<dyn Error>> {
    let row = table.get_row_data(Some(row_id))?;
    let strings = table.convert_data_row_to_string_row(&row)?;
    let mut columns: Vec<_> = strings.into_iter().collect();
    columns.sort_by_key(|(id, _)| *id);
    let rendered: Vec<String> = columns
        .into_iter()
        .map(|(_, value)| value.unwrap_or_else(|| "NULL".to_string()))
        .collect();
    Ok(format!("[{row_id}] {}", rendered.join(" | ")))
}
