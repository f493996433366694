//! CLI entry point for `mboxstore`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxstore::config::{self, Config};
use mboxstore::model::message::{Flag, MessageRecord};
use mboxstore::parser::separator::Dialect;
use mboxstore::progress::ProgressEvent;
use mboxstore::store::{CheckStatus, Mailbox, MailboxBuilder, MailboxOptions, SyncOutcome};

/// How many times a sync is retried after new mail arrived underneath it.
const SYNC_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(
    name = "mboxstore",
    version,
    about = "Inspect and maintain mbox and MMDF mailboxes in place"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Treat the mailbox as MMDF
    #[arg(long, global = true, conflicts_with = "mbox")]
    mmdf: bool,

    /// Treat the mailbox as mbox
    #[arg(long, global = true)]
    mbox: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mailbox statistics
    Stats {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List messages
    List {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete messages (1-based numbers as shown by `list`) and compact the file
    Delete {
        path: PathBuf,
        #[arg(required = true, value_name = "N")]
        messages: Vec<usize>,
    },
    /// Change message flags and write them to the file
    Mark {
        path: PathBuf,
        #[arg(required = true, value_name = "N")]
        messages: Vec<usize>,
        #[arg(long, conflicts_with = "unread")]
        read: bool,
        #[arg(long)]
        unread: bool,
        #[arg(long, conflicts_with = "unflag")]
        flag: bool,
        #[arg(long)]
        unflag: bool,
        #[arg(long)]
        replied: bool,
    },
    /// Append a message read from FILE or stdin
    Append {
        path: PathBuf,
        /// Envelope sender (defaults to Return-Path or From)
        #[arg(short, long)]
        sender: Option<String>,
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Poll the mailbox for changes
    Watch {
        path: PathBuf,
        /// Seconds between checks
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
        /// Stop after this many checks
        #[arg(short, long)]
        count: Option<u64>,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let mut options = MailboxOptions::from_config(&config);
    if cli.mmdf {
        options.dialect = Some(Dialect::Mmdf);
    } else if cli.mbox {
        options.dialect = Some(Dialect::Mbox);
    }

    match cli.command {
        Commands::Stats { path, json } => cmd_stats(&path, options, json),
        Commands::List { path, json } => cmd_list(&path, options, json),
        Commands::Delete { path, messages } => cmd_delete(&path, options, &messages),
        Commands::Mark {
            path,
            messages,
            read,
            unread,
            flag,
            unflag,
            replied,
        } => {
            let mut changes = Vec::new();
            if read || unread {
                changes.push((Flag::Read, read));
            }
            if flag || unflag {
                changes.push((Flag::Flagged, flag));
            }
            if replied {
                changes.push((Flag::Replied, true));
            }
            if changes.is_empty() {
                anyhow::bail!("nothing to change: pass --read, --unread, --flag, --unflag or --replied");
            }
            cmd_mark(&path, options, &messages, &changes)
        }
        Commands::Append { path, sender, file } => {
            cmd_append(&path, options, sender.as_deref(), file.as_deref())
        }
        Commands::Watch {
            path,
            interval,
            count,
        } => cmd_watch(&path, options, Duration::from_secs(interval), count),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_file = config::log_file_path(config);
    let log_dir = log_file.parent().map(Path::to_path_buf).unwrap_or_default();
    let file_name = log_file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    if !file_name.is_empty() && std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxstore", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Progress bar fed by the mailbox's progress events.
fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb
}

fn progress_sink(pb: &ProgressBar) -> Box<dyn Fn(ProgressEvent) + Send> {
    let pb = pb.clone();
    Box::new(move |event| match event {
        ProgressEvent::Reading { done, total } => {
            pb.set_message("Reading");
            pb.set_length(total);
            pb.set_position(done);
        }
        ProgressEvent::Writing { done, total } => {
            pb.set_message("Writing");
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        }
    })
}

/// Open and parse a mailbox behind a progress bar.
fn open_mailbox(path: &Path, options: MailboxOptions) -> anyhow::Result<Mailbox> {
    let pb = progress_bar();
    let mailbox = MailboxBuilder::new(path)
        .options(options)
        .progress(progress_sink(&pb))
        .open()
        .with_context(|| format!("cannot open {}", path.display()));
    pb.finish_and_clear();
    mailbox
}

/// Show statistics for a mailbox.
fn cmd_stats(path: &Path, options: MailboxOptions, json: bool) -> anyhow::Result<()> {
    let start = Instant::now();
    let mailbox = open_mailbox(path, options)?;
    let elapsed = start.elapsed();

    let records = mailbox.records();
    let count = |pred: fn(&MessageRecord) -> bool| records.iter().filter(|r| pred(r)).count();
    let new = count(MessageRecord::is_new);
    let unread = count(|r| !r.flags.read);
    let flagged = count(|r| r.flags.flagged);
    let replied = count(|r| r.flags.replied);
    let range = date_range(records);
    let size = mailbox.snapshot().size;

    if json {
        let stats = serde_json::json!({
            "file": path.to_string_lossy(),
            "dialect": mailbox.dialect(),
            "file_size": size,
            "message_count": records.len(),
            "new": new,
            "unread": unread,
            "flagged": flagged,
            "replied": replied,
            "readonly": mailbox.is_readonly(),
            "date_range": range.map(|(min, max)| serde_json::json!({
                "oldest": min.to_rfc3339(),
                "newest": max.to_rfc3339(),
            })),
            "parse_time_ms": elapsed.as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<20} {}", "File:", path.display());
    println!("  {:<20} {}", "Format:", mailbox.dialect());
    println!("  {:<20} {}", "File size:", format_size(size, BINARY));
    println!("  {:<20} {}", "Messages:", records.len());
    println!("  {:<20} {new} new, {unread} unread", "Status:");
    println!("  {:<20} {flagged} flagged, {replied} replied", "");
    if let Some((min, max)) = range {
        println!(
            "  {:<20} {} to {}",
            "Date range:",
            min.format("%Y-%m-%d"),
            max.format("%Y-%m-%d")
        );
    }
    if mailbox.is_readonly() {
        println!("  {:<20} yes", "Read-only:");
    }
    println!("  {:<20} {:.2?}", "Parse time:", elapsed);
    println!();
    Ok(())
}

/// List messages, one per line.
fn cmd_list(path: &Path, options: MailboxOptions, json: bool) -> anyhow::Result<()> {
    let mailbox = open_mailbox(path, options)?;

    if json {
        let items: Vec<serde_json::Value> = mailbox
            .records()
            .iter()
            .enumerate()
            .map(|(i, r)| {
                serde_json::json!({
                    "number": i + 1,
                    "offset": r.offset,
                    "size": r.body_length(),
                    "lines": r.line_count,
                    "date": message_date(r).map(|d| d.to_rfc3339()),
                    "from": sender(r),
                    "subject": r.envelope.subject,
                    "message_id": r.envelope.message_id,
                    "flags": r.flags,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for (i, record) in mailbox.records().iter().enumerate() {
        let date = message_date(record)
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:>6} {} {:<16} {:<30} {}",
            i + 1,
            record.flags.summary(),
            date,
            truncate(&sender(record), 30),
            record.envelope.subject.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Mark messages deleted and compact.
fn cmd_delete(path: &Path, options: MailboxOptions, messages: &[usize]) -> anyhow::Result<()> {
    cmd_mark(path, options, messages, &[(Flag::Deleted, true)])
}

/// Apply flag changes to the selected messages and sync.
fn cmd_mark(
    path: &Path,
    options: MailboxOptions,
    messages: &[usize],
    changes: &[(Flag, bool)],
) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(path, options)?;
    if mailbox.is_readonly() {
        anyhow::bail!("{} is read-only or locked by another program", path.display());
    }

    let indices = to_indices(messages, mailbox.len())?;
    for _ in 0..SYNC_ATTEMPTS {
        for &index in &indices {
            for &(flag, value) in changes {
                mailbox.set_flag(index, flag, value)?;
            }
        }

        let pb = progress_bar();
        mailbox.set_progress(Some(progress_sink(&pb)));
        let outcome = mailbox.sync();
        pb.finish_and_clear();
        match outcome? {
            SyncOutcome::Clean => {
                println!("  Nothing to write");
                return Ok(());
            }
            SyncOutcome::Synced { removed, .. } => {
                if removed > 0 {
                    println!("  Removed {removed} message(s)");
                }
                println!(
                    "  {} message(s) left in {}",
                    mailbox.len(),
                    path.display()
                );
                return Ok(());
            }
            // Appends keep existing numbering, so the same selection still applies.
            SyncOutcome::ExternalChange(CheckStatus::NewMail) => {
                eprintln!("  New mail arrived, retrying");
            }
            SyncOutcome::ExternalChange(status) => {
                anyhow::bail!(
                    "{} was changed by another program ({status:?}); list it again before retrying",
                    path.display()
                );
            }
        }
    }
    anyhow::bail!("{} keeps changing, giving up", path.display())
}

/// Deliver one message.
fn cmd_append(
    path: &Path,
    options: MailboxOptions,
    sender: Option<&str>,
    file: Option<&Path>,
) -> anyhow::Result<()> {
    let mut raw = Vec::new();
    match file {
        Some(file) => {
            raw = std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
        }
        None => {
            std::io::stdin().read_to_end(&mut raw)?;
        }
    }
    if raw.is_empty() {
        anyhow::bail!("empty message");
    }

    let mut mailbox = Mailbox::open_append(path, options)
        .with_context(|| format!("cannot open {} for appending", path.display()))?;
    let offset = mailbox.append_message(&raw, sender, None)?;
    mailbox.close()?;
    println!("  Appended at offset {offset} to {}", path.display());
    Ok(())
}

/// Poll for changes and report them.
fn cmd_watch(
    path: &Path,
    options: MailboxOptions,
    interval: Duration,
    count: Option<u64>,
) -> anyhow::Result<()> {
    let mut mailbox = open_mailbox(path, options)?;
    mailbox.set_quiet(true);
    println!("  Watching {} ({} messages)", path.display(), mailbox.len());

    let mut checks = 0u64;
    while count.is_none_or(|limit| checks < limit) {
        std::thread::sleep(interval);
        checks += 1;

        let before = mailbox.len();
        let status = match mailbox.check() {
            Ok(status) => status,
            // Aborted or I/O trouble on one poll: try again next time.
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "Check failed");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match status {
            CheckStatus::Unchanged => {}
            CheckStatus::NewMail => {
                println!("  {} new message(s)", mailbox.len().saturating_sub(before));
            }
            CheckStatus::Reopened => {
                println!(
                    "  Mailbox was rewritten by another program, {} messages",
                    mailbox.len()
                );
            }
            CheckStatus::Locked => {
                tracing::debug!("Mailbox locked, skipping this check");
            }
        }
    }
    Ok(())
}

/// Convert 1-based message numbers to catalog indices.
fn to_indices(messages: &[usize], len: usize) -> anyhow::Result<Vec<usize>> {
    messages
        .iter()
        .map(|&n| {
            if n == 0 || n > len {
                anyhow::bail!("no message {n} (mailbox has {len})");
            }
            Ok(n - 1)
        })
        .collect()
}

fn message_date(record: &MessageRecord) -> Option<chrono::DateTime<chrono::Utc>> {
    record.envelope.date_sent.or(record.received)
}

fn date_range(
    records: &[MessageRecord],
) -> Option<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
    let mut dates = records.iter().filter_map(message_date);
    let first = dates.next()?;
    Some(dates.fold((first, first), |(min, max), d| (min.min(d), max.max(d))))
}

fn sender(record: &MessageRecord) -> String {
    match record.envelope.from.first() {
        Some(addr) if !addr.display_name.is_empty() => addr.display_name.clone(),
        Some(addr) => addr.address.clone(),
        None => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
