use clap::{Arg, Command, value_parser};
use log::warn;
use nut4nt_dumper::regdump::RegisterLogEntry;
use std::{
    collections::BTreeMap,
    error::Error,
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

#[derive(Default)]
struct ChannelSummary {
    entries: u64,
    last: Option<RegisterLogEntry>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("regdump-inspect")
        .about("Summarize a register log written by nut4nt-dump")
        .arg(
            Arg::new("log")
                .value_parser(value_parser!(PathBuf))
                .default_value("regdump.txt")
                .help("Register log file"),
        )
        .arg(
            Arg::new("channels")
                .long("channels")
                .value_parser(value_parser!(u8).range(1..=16))
                .default_value("4")
                .help("Number of frontend channels on the board"),
        )
        .get_matches();

    let path = matches
        .get_one::<PathBuf>("log")
        .ok_or("missing register log path")?;
    let n_channels = matches.get_one::<u8>("channels").copied().unwrap_or(4);
    let reader = BufReader::new(File::open(path)?);

    let mut channels: BTreeMap<u8, ChannelSummary> = BTreeMap::new();
    let mut first_ms = None;
    let mut last_ms = 0;
    let mut skipped = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = match line.parse::<RegisterLogEntry>() {
            Ok(entry) => entry,
            Err(e) => {
                warn!("line {}: {e}", idx + 1);
                skipped += 1;
                continue;
            }
        };
        first_ms.get_or_insert(entry.timestamp_ms);
        last_ms = entry.timestamp_ms;

        // The control register reads back the selected channel in its high nibble.
        let summary = channels.entry(entry.values[0] >> 4).or_default();
        summary.entries += 1;
        summary.last = Some(entry);
    }

    let total: u64 = channels.values().map(|c| c.entries).sum();
    let span_ms = first_ms.map_or(0, |first| last_ms.saturating_sub(first));
    println!(
        "{}: {} entries over {:.3} s ({} malformed lines skipped)",
        path.display(),
        total,
        span_ms as f64 / 1000.0,
        skipped
    );
    for channel in 0..n_channels {
        match channels.get(&channel).and_then(|summary| summary.last.map(|last| (summary, last))) {
            Some((summary, last)) => println!(
                "channel {channel}: {:6} entries, last: {}",
                summary.entries,
                last.to_string().trim_start()
            ),
            None => println!("channel {channel}: no entries"),
        }
    }
    let stray: u64 = channels.range(n_channels..).map(|(_, c)| c.entries).sum();
    if stray > 0 {
        warn!("{stray} entries name a channel outside 0..{n_channels}");
    }

    Ok(())
}
