//! Out-of-process log reader.
//!
//! Polls the node's shared-memory log ring and prints records to
//! stdout. Survives producer restarts by watching the shm object for
//! re-creation (inode change) and reopening transparently.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use blockrt::rtlog::client::{LogClient, ReadStatus};
use blockrt::rtlog::{LogRecord, LOG_SHM_FILENAME};
use blockrt::time::NSEC_PER_USEC;

#[derive(Parser)]
#[command(name = "blockrt-log", about = "tail the blockrt shared-memory log buffer")]
struct Args {
    /// Skip the backlog: start at the write pointer instead of the
    /// oldest retained record.
    #[arg(short = 'O', long)]
    no_backlog: bool,

    /// Wait for the shm object to appear instead of failing when it
    /// does not exist yet.
    #[arg(short, long)]
    wait: bool,

    /// Name of the shm object to tail.
    #[arg(long, default_value = LOG_SHM_FILENAME)]
    file: String,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,
}

fn print_record(rec: &LogRecord) {
    let level = rec.level().map(|l| l.as_str()).unwrap_or("INVALID");
    println!(
        "[{}.{:06}] {} {}: {}",
        rec.ts().sec,
        rec.ts().nsec / NSEC_PER_USEC,
        rec.src(),
        level,
        rec.msg()
    );
}

/// Inode of the shm object as visible in the filesystem, or None while
/// it does not exist.
fn shm_inode(file: &str) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(Path::new("/dev/shm").join(file))
        .ok()
        .map(|m| m.ino())
}

fn open(args: &Args) -> Result<LogClient, std::io::Error> {
    let mut client = LogClient::open(&args.file)?;
    // open() positions at the write pointer, which is what -O wants.
    if !args.no_backlog {
        client.seek_to_oldest();
    }
    Ok(client)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let poll = Duration::from_millis(args.poll_ms.max(1));

    let mut client = loop {
        match open(&args) {
            Ok(client) => break client,
            Err(_) if args.wait => std::thread::sleep(poll),
            Err(e) => {
                eprintln!("blockrt-log: cannot open log shm {}: {e}", args.file);
                return ExitCode::FAILURE;
            }
        }
    };

    loop {
        let (status, rec) = client.read_frame();
        match status {
            ReadStatus::NewData => {
                if let Some(rec) = rec {
                    print_record(&rec);
                }
            }
            ReadStatus::NoData => {
                // Idle: check whether the producer re-created the shm.
                match shm_inode(&args.file) {
                    Some(ino) if ino == client.inode() => (),
                    _ => {
                        if let Ok(fresh) = open(&args) {
                            eprintln!("blockrt-log: log shm re-created, reopening");
                            client = fresh;
                            continue;
                        }
                    }
                }
                std::thread::sleep(poll);
            }
            ReadStatus::Overrun | ReadStatus::Error => {
                eprintln!("blockrt-log: overrun, skipping to current write position");
                client.reset();
            }
        }
    }
}
