extern crate keepass;
extern crate rpassword;

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::process;

use keepass::kdb3::{Config, Database, Error, Manager, Outcome, ProgressMonitor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};


fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <file.kdb> [key file]", args[0]);
        process::exit(1);
    }

    if let Err(err) = run(Path::new(&args[1]), args.get(2).map(Path::new)) {
        eprintln!("{}: {}", args[1], err);
        process::exit(1);
    }
}


fn run(filename: &Path, key_file: Option<&Path>) -> Result<(), Error> {
    let config = match env::var_os("KSVIEW_CONFIG") {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };
    let manager = Manager::new(config);

    let password = rpassword::prompt_password("Database password: ")?;
    // an empty password means key file only
    let password = if password.is_empty() && key_file.is_some() { None } else { Some(password.as_str()) };

    let mut monitor = ProgressMonitor::default();
    let mut db = match manager.load(filename, password, key_file, Some(&mut monitor))? {
        Outcome::Done(db) => db,
        Outcome::Canceled => return Ok(()),
    };

    let stats = db.performance_statistics();
    tracing::debug!(
        "Loaded in {:?} (key transform {:?}, decryption {:?})",
        stats.load_time + stats.key_transform_time + stats.decryption_time + stats.content_extraction_time,
        stats.key_transform_time,
        stats.decryption_time
    );

    print_query(&db);
    db.close();
    Ok(())
}


fn print_query(db: &Database) {
    let mut groups = HashMap::new();
    let mut glen = 1;

    for g in db.groups() {
        let path = db.group_path(g.id()).unwrap_or_default();
        if path.len() > glen {
            glen = path.len();
        }
        groups.insert(g.id(), path);
    }

    let def = "?".to_string();
    for e in db.entries().iter().filter(|e| !e.is_internal()) {
        let group = e.group_id().and_then(|id| groups.get(&id)).unwrap_or(&def);
        let password = e.password_str();
        println!(
            "{:<width$}\t| {}\t| {}\t| {}\t| {}",
            group,
            e.title().unwrap_or_default(),
            e.username().unwrap_or_default(),
            password.as_deref().map_or("", |p| p.as_str()),
            e.url().unwrap_or_default(),
            width = glen
        );
    }
}
