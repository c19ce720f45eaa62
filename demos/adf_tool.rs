//! Inspect and manage a local area-description store.
//!
//! Usage:
//!   cargo run --example adf_tool -- [--store DIR] list
//!   cargo run --example adf_tool -- [--store DIR] show <uuid>
//!   cargo run --example adf_tool -- [--store DIR] rename <uuid> <name>
//!   cargo run --example adf_tool -- [--store DIR] delete <uuid>
//!   cargo run --example adf_tool -- [--store DIR] export <uuid> <dir>
//!   cargo run --example adf_tool -- [--store DIR] import <file>
//!
//! The store directory defaults to `$AREATRACK_STORE`, then `./adf_store`.

use areatrack::store::KEY_NAME;
use areatrack::{AdfStore, AreaMap};
use std::path::Path;

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut root = std::env::var("AREATRACK_STORE").unwrap_or_else(|_| "adf_store".into());
    if args.first().map(String::as_str) == Some("--store") {
        if args.len() < 2 {
            usage();
        }
        root = args.remove(1);
        args.remove(0);
    }

    let store = match AdfStore::open(&root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open store {}: {}", root, e);
            std::process::exit(1);
        }
    };

    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    let result: areatrack::Result<()> = match argv.as_slice() {
        ["list"] | [] => {
            let all = store.list_all();
            if all.is_empty() {
                println!("No area descriptions in {}", root);
            }
            for s in all {
                println!("{}  {}", s.uuid, s.name.as_deref().unwrap_or("<unnamed>"));
            }
            Ok(())
        }
        ["show", uuid] => store.load(uuid).map_err(Into::into).map(|record| {
            println!("uuid:    {}", record.uuid);
            for (k, v) in &record.metadata {
                println!("{:<8} {}", format!("{}:", k), v);
            }
            println!("payload: {} bytes", record.payload.len());
            match AreaMap::decode(&record.payload) {
                Ok(map) => println!("map:     {} landmarks", map.len()),
                Err(e) => println!("map:     unreadable ({})", e),
            }
        }),
        ["rename", uuid, name] => store.set_metadata(uuid, KEY_NAME, name).map_err(Into::into),
        ["delete", uuid] => store.delete(uuid).map_err(Into::into),
        ["export", uuid, dir] => store.export(uuid, Path::new(dir)).map_err(Into::into).map(|path| {
            println!("Exported to {}", path.display());
        }),
        ["import", file] => store.import(Path::new(file)).map_err(Into::into).map(|record| {
            println!("Imported as {}", record.uuid);
        }),
        _ => usage(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn usage() -> ! {
    eprintln!("usage: adf_tool [--store DIR] <list|show|rename|delete|export|import> [args]");
    std::process::exit(2);
}
