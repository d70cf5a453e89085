use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use ikats::config::SessionConfig;
use ikats::error::{IkatsError, Result};
use ikats::parser::{self, Command};
use ikats::{DataPoint, Fid, Ikats, Timeseries, Tsuid};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Interactive IKATS client", long_about = None)]
struct Args {
    /// JSON session file; flags below override it
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(long)]
    host: Option<String>,

    #[clap(long)]
    port: Option<u16>,

    /// Work on a private in-memory backend instead of a server
    #[clap(long)]
    emulated: bool,
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn,ikats=warn");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    print_banner();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            println!("[\u{2717}] Can't start runtime: {}", e);
            return;
        }
    };

    let client = match connect(&args) {
        Ok(client) => client,
        Err(e) => {
            println!("[\u{2717}] {}", e);
            return;
        }
    };

    match runtime.block_on(client.datasets().list()) {
        Ok(_) => println!("[\u{2713}] Connected to IKATS{}", if args.emulated { " (emulated)" } else { "" }),
        Err(e) => {
            println!("[\u{2717}] Could not reach IKATS: {}", e);
            println!("    Make sure 'ikats-emulator' (or a real instance) is running.");
            return;
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("ikats> ");
        let _ = io::stdout().flush();
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = runtime.block_on(execute_command(&client, cmd)) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("IMPORT") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try \"IMPORT 'my_fid' VALUES [(1000, 1.5), (2000, 2.5)]\"");
                } else if buffer.to_uppercase().starts_with("SET") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try \"SET 'my_fid' unit = \\\"m/s\\\" AS string\"");
                }
            }
        }
    }
}

fn connect(args: &Args) -> Result<Ikats> {
    if args.emulated {
        return Ikats::emulated();
    }
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    Ikats::connect(&config)
}

fn print_banner() {
    println!("\n==================================================");
    println!("   IKATS CLI v{} - Timeseries at your fingertips", env!("CARGO_PKG_VERSION"));
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. CREATE:  CREATE 'fid'");
    println!("2. TSUID:   TSUID 'fid'");
    println!("3. FID:     FID 'tsuid'");
    println!("4. IMPORT:  IMPORT 'fid' VALUES [(1000, 1.5), ...] [PARENT 'fid']");
    println!("5. FETCH:   FETCH 'fid' [FROM 1000 TO 2000]");
    println!("6. META:    META 'fid'");
    println!("7. SET:     SET 'fid' name = \"value\" [AS string|date|number|complex]");
    println!("8. FIND:    FIND name = \"value\"");
    println!("9. DELETE:  DELETE 'fid'");
    println!("10. LIST:   LIST");
    println!("11. TABLES: TABLES");
    println!("12. OPERATORS: OPERATORS");
    println!("13. EXIT:   Quit\n");
}

async fn execute_command(client: &Ikats, cmd: Command) -> Result<()> {
    match cmd {
        Command::Help => { print_help(); Ok(()) },
        Command::Create { fid } => {
            let ts = client.timeseries().new_timeseries(Some(Fid::new(fid)?)).await?;
            if let (Some(fid), Some(tsuid)) = (&ts.fid, &ts.tsuid) {
                println!("[\u{2713} OK] Created {} -> {}", fid, tsuid);
            }
            Ok(())
        },
        Command::Tsuid { fid } => {
            match client.timeseries().fid_to_tsuid(&Fid::new(fid.clone())?).await? {
                Some(tsuid) => println!("{}", tsuid),
                None => println!("[\u{2717}] Unknown FID {}.", fid),
            }
            Ok(())
        },
        Command::Fid { tsuid } => {
            match client.timeseries().tsuid_to_fid(&Tsuid::new(tsuid.clone())?).await? {
                Some(fid) => println!("{}", fid),
                None => println!("[\u{2717}] No FID for {}.", tsuid),
            }
            Ok(())
        },
        Command::Import { fid, points, parent } => perform_import(client, fid, points, parent).await,
        Command::Fetch { fid, range } => {
            let ts = client.timeseries().get(Some(&Fid::new(fid)?), None).await?;
            let (start, end) = match range {
                Some((start, end)) => (Some(start), Some(end)),
                None => (None, None),
            };
            let points = client.timeseries().fetch(&ts, start, end).await?;
            println!("\n{} points:", points.len());
            for p in points {
                println!("  {} | {}", p.timestamp, p.value);
            }
            println!();
            Ok(())
        },
        Command::Meta { fid } => {
            let ts = client.timeseries().get(Some(&Fid::new(fid)?), None).await?;
            println!("\nMetadata of {}:", ts.tsuid.as_ref().map(Tsuid::as_str).unwrap_or("?"));
            for (name, entry) in &ts.metadata {
                println!("  {} = \"{}\" ({})", name, entry.value, entry.dtype);
            }
            println!();
            Ok(())
        },
        Command::Set { fid, name, value, dtype } => {
            let tsuid = require_tsuid(client, &fid).await?;
            client.metadata().set(&tsuid, &name, &value, dtype.unwrap_or_default()).await?;
            println!("[\u{2713} OK] {}.{} = \"{}\"", fid, name, value);
            Ok(())
        },
        Command::Find { name, value } => {
            let mut constraint = BTreeMap::new();
            constraint.insert(name, vec![value]);
            let found = client.timeseries().find_from_meta(&constraint).await?;
            println!("\nFound {} matches:", found.len());
            for r in found {
                println!("  \u{2022} {} ({})", r.fid, r.tsuid);
            }
            println!();
            Ok(())
        },
        Command::Delete { fid } => {
            let ts = Timeseries::with_ids(None, Some(Fid::new(fid.clone())?));
            if client.timeseries().delete(&ts, true).await? {
                println!("[\u{2713} OK] Deleted {}", fid);
            } else {
                println!("[\u{2717}] Unknown FID {}.", fid);
            }
            Ok(())
        },
        Command::List => {
            let all = client.timeseries().list().await?;
            println!("\n{} timeseries:", all.len());
            for r in all {
                println!("  \u{2022} {} ({})", r.fid, r.tsuid);
            }
            println!();
            Ok(())
        },
        Command::Tables => {
            let tables = client.tables().list(None, true).await?;
            println!("\n{} tables:", tables.len());
            for t in tables {
                println!("  \u{2022} {} {}", t.name, t.description);
            }
            println!();
            Ok(())
        },
        Command::Operators => {
            let ops = client.operators().list().await?;
            println!("\n{} operators:", ops.len());
            for op in ops {
                println!("  \u{2022} {} [{}]", op.name, op.family.as_deref().unwrap_or("-"));
            }
            println!();
            Ok(())
        },
        Command::Exit => Ok(()),
    }
}

async fn require_tsuid(client: &Ikats, fid: &str) -> Result<Tsuid> {
    let fid = Fid::new(fid)?;
    client
        .timeseries()
        .fid_to_tsuid(&fid)
        .await?
        .ok_or_else(|| IkatsError::NotFound(format!("FID {} not found", fid)))
}

async fn perform_import(client: &Ikats, fid: String, points: Vec<(i64, f64)>, parent: Option<String>) -> Result<()> {
    let fid = Fid::new(fid)?;
    let parent = match parent {
        Some(p) => Some(require_tsuid(client, &p).await?),
        None => None,
    };

    // appending to an existing timeseries keeps its identity
    let tsuid = client.timeseries().fid_to_tsuid(&fid).await?;
    let mut ts = Timeseries::with_ids(tsuid, Some(fid));
    ts.data = points.into_iter().map(DataPoint::from).collect();

    let summary = client.timeseries().save(&mut ts, parent.as_ref(), true).await?;
    if summary.is_partial() {
        println!("[\u{26a0}\u{fe0f} Partial] {} of {} points written to {}", summary.nb_points, summary.submitted, summary.tsuid);
    } else {
        println!("[\u{2713} OK] {} points written to {}", summary.nb_points, summary.tsuid);
    }
    if let (Some(start), Some(end)) = (summary.start_date, summary.end_date) {
        println!("    Range: {} -> {}", start, end);
    }
    if summary.inherited > 0 {
        println!("    Inherited {} metadata", summary.inherited);
    }
    Ok(())
}
