//! lpr_outbox - operator tool for the outbox database

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use lpr_edge::{DeliveryStatus, Outbox, PersistedRecord, RecordFilter, SqliteOutbox};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the outbox database.
    #[arg(long, env = "LPR_DB_PATH", default_value = "db/lpr_data.db")]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the newest records.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Search by plate substring, hostname or status (pending|sent|failed).
    Search {
        #[arg(long)]
        plate: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        status: Option<DeliveryStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one record.
    Show { id: i64 },
    /// Count records per delivery status.
    Stats,
    /// Move failed records back to pending.
    Requeue,
    /// Move every record back to pending, including sent ones.
    Reset {
        /// Required; this re-delivers everything.
        #[arg(long)]
        yes: bool,
    },
    /// Delete one record.
    Delete { id: i64 },
    /// Delete every delivered record.
    PurgeSent,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut outbox = SqliteOutbox::open(&args.db_path)?;

    match args.command {
        Command::List { limit } => {
            let records = outbox.search(&RecordFilter {
                limit: Some(limit),
                ..RecordFilter::default()
            })?;
            print_records(&records);
        }
        Command::Search {
            plate,
            hostname,
            status,
            limit,
        } => {
            let records = outbox.search(&RecordFilter {
                license_plate: plate.map(|p| p.to_uppercase()),
                hostname,
                status,
                limit,
            })?;
            print_records(&records);
        }
        Command::Show { id } => {
            let record = outbox
                .get(id)?
                .ok_or_else(|| anyhow!("record {} not found", id))?;
            let rec = &record.record;
            println!("id:            {}", record.id);
            println!("plate:         {}", rec.license_text);
            println!("timestamp:     {}", rec.timestamp);
            println!("status:        {}", record.status);
            println!("location:      {}", rec.location);
            println!("hostname:      {}", rec.hostname);
            println!("vehicle image: {}", rec.vehicle_image_ref);
            println!("plate image:   {}", rec.plate_image_ref);
            println!("cropped image: {}", rec.cropped_image_ref);
            if let Some(err) = &record.last_error {
                println!("last error:    {}", err);
            }
        }
        Command::Stats => {
            let counts = outbox.counts()?;
            println!(
                "pending={} sent={} failed={}",
                counts.pending, counts.sent, counts.failed
            );
        }
        Command::Requeue => {
            println!("requeued {} failed records", outbox.requeue_failed()?);
        }
        Command::Reset { yes } => {
            if !yes {
                return Err(anyhow!("reset re-delivers every record; pass --yes to confirm"));
            }
            println!("reset {} records to pending", outbox.reset_all()?);
        }
        Command::Delete { id } => {
            if !outbox.delete(id)? {
                return Err(anyhow!("record {} not found", id));
            }
            println!("deleted record {}", id);
        }
        Command::PurgeSent => {
            println!("purged {} sent records", outbox.purge_sent()?);
        }
    }
    Ok(())
}

fn print_records(records: &[PersistedRecord]) {
    if records.is_empty() {
        println!("no records");
        return;
    }
    println!("{:>6}  {:<12}  {:<15}  {:<8}  {}", "id", "plate", "timestamp", "status", "hostname");
    for record in records {
        println!(
            "{:>6}  {:<12}  {:<15}  {:<8}  {}",
            record.id,
            record.record.license_text,
            record.record.timestamp,
            record.status.as_str(),
            record.record.hostname
        );
    }
}
