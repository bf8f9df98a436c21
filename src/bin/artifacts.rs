use anyhow::{Context, Result, bail};
use clap::builder::PossibleValuesParser;
use clap::{Arg, ArgAction, ArgMatches, Command};
use encoding::all::encodings;
use encoding::types::{Encoding, EncodingRef};
use jiff::Timestamp;
use log::{LevelFilter, debug};
use serde_json::json;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use evtx_artifacts::{
    DecodeStats, EventFilter, EvtxEvent, EvtxParser, Level, ParserSettings, format_timestamp,
};

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::exit;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OutputFormat {
    Summary,
    Csv,
    Json,
}

struct Artifacts {
    input: PathBuf,
    parser_settings: ParserSettings,
    filter: EventFilter,
    output_format: OutputFormat,
    verbosity_level: Option<LevelFilter>,
}

const CSV_HEADER: &str = "record_id,timestamp,event_id,level,provider,computer,channel,recovered";

impl Artifacts {
    fn from_cli_matches(matches: &ArgMatches) -> Result<Self> {
        let input = matches
            .get_one::<PathBuf>("INPUT")
            .cloned()
            .context("missing input file")?;

        let output_format = match matches.get_one::<String>("output-format").map(String::as_str) {
            Some("csv") => OutputFormat::Csv,
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Summary,
        };

        let num_threads = matches.get_one::<usize>("num-threads").copied().unwrap_or(0);
        let num_threads = if cfg!(feature = "multithreading") {
            num_threads
        } else {
            if num_threads != 1 {
                eprintln!(
                    "turned on threads, but library was compiled without `multithreading` feature! using fallback sync iterator"
                );
            }
            1
        };

        let validate_checksums = !matches.get_flag("no-validate-checksums");

        let codec_name = matches
            .get_one::<String>("ansi-codec")
            .map(String::as_str)
            .unwrap_or("windows-1252");
        let ansi_codec: EncodingRef = *encodings()
            .iter()
            .find(|c| c.name() == codec_name)
            .with_context(|| format!("unknown ansi codec `{codec_name}`"))?;

        let verbosity_level = match matches.get_count("verbose") {
            0 => None,
            1 => Some(LevelFilter::Info),
            2 => Some(LevelFilter::Debug),
            3 => Some(LevelFilter::Trace),
            _ => {
                eprintln!("using more than -vvv does not affect verbosity level");
                Some(LevelFilter::Trace)
            }
        };

        let filter = EventFilter {
            event_ids: matches
                .get_many::<u32>("event-id")
                .map(|ids| ids.copied().collect())
                .unwrap_or_default(),
            levels: matches
                .get_many::<Level>("level")
                .map(|levels| levels.copied().collect())
                .unwrap_or_default(),
            since: matches.get_one::<Timestamp>("since").copied(),
            until: matches.get_one::<Timestamp>("until").copied(),
        };

        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since >= until {
                bail!("`--since` ({since}) must be earlier than `--until` ({until})");
            }
        }

        Ok(Artifacts {
            input,
            parser_settings: ParserSettings::new()
                .num_threads(num_threads)
                .validate_checksums(validate_checksums)
                .recovery_scan(!matches.get_flag("no-recovery"))
                .ansi_codec(ansi_codec),
            filter,
            output_format,
            verbosity_level,
        })
    }

    fn run(&self) -> Result<()> {
        self.try_to_initialize_logging();

        let parser = EvtxParser::from_path(&self.input)
            .with_context(|| format!("Failed to parse {}", self.input.display()))?
            .with_configuration(self.parser_settings.clone());

        debug!(
            "{} chunks in {} (header says {})",
            parser.chunk_count(),
            self.input.display(),
            parser.header().chunk_count
        );

        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());

        if self.output_format == OutputFormat::Csv {
            writeln!(out, "{CSV_HEADER}")?;
        }

        let mut matched = 0_usize;
        let stats = if self.parser_settings.get_num_threads() == 1 {
            let mut events = parser.events();
            for event in events.by_ref() {
                matched += self.dump_event(&mut out, &event)?;
            }
            events.stats()
        } else {
            let (events, stats) = parser.events_parallel();
            for event in &events {
                matched += self.dump_event(&mut out, event)?;
            }
            stats
        };

        out.flush()?;
        print_summary(&stats, matched);
        Ok(())
    }

    /// Writes the event if it passes the filter. Returns the number of events written.
    fn dump_event(&self, out: &mut impl Write, event: &EvtxEvent) -> Result<usize> {
        if !self.filter.matches(event) {
            return Ok(0);
        }

        match self.output_format {
            OutputFormat::Summary => writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}{}",
                event.record_id(),
                format_timestamp(&event.timestamp()),
                optional(event.event_id()),
                event
                    .level()
                    .and_then(Level::from_u8)
                    .map_or_else(|| "-".to_owned(), |l| l.to_string()),
                event.provider_name().unwrap_or_else(|| "-".to_owned()),
                event.computer().unwrap_or_else(|| "-".to_owned()),
                if event.is_recovered() { "\t(recovered)" } else { "" },
            )?,
            OutputFormat::Csv => writeln!(
                out,
                "{},{},{},{},{},{},{},{}",
                event.record_id(),
                format_timestamp(&event.timestamp()),
                optional(event.event_id()),
                optional(event.level()),
                csv_field(&event.provider_name().unwrap_or_default()),
                csv_field(&event.computer().unwrap_or_default()),
                csv_field(&event.channel().unwrap_or_default()),
                event.is_recovered(),
            )?,
            OutputFormat::Json => {
                let value = json!({
                    "record_id": event.record_id(),
                    "timestamp": format_timestamp(&event.timestamp()),
                    "chunk": event.chunk_number(),
                    "recovered": event.is_recovered(),
                    "partial": event.is_partial(),
                    "event": event.to_json_value(),
                });
                writeln!(out, "{value}")?
            }
        }

        Ok(1)
    }

    fn try_to_initialize_logging(&self) {
        if let Some(level) = self.verbosity_level {
            if let Err(e) = TermLogger::init(
                level,
                Config::default(),
                TerminalMode::Stderr,
                ColorChoice::Auto,
            ) {
                eprintln!("Failed to initialize logging: {e}");
            }
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

fn print_summary(stats: &DecodeStats, matched: usize) {
    eprintln!(
        "{} events in {} chunks ({} empty, {} dirty); {} recovered, {} carved, {} partial, {} records skipped; {} matched",
        stats.events,
        stats.chunks,
        stats.empty_chunks,
        stats.dirty_chunks,
        stats.recovered_events,
        stats.carved_events,
        stats.partial_events,
        stats.skipped_records,
        matched
    );
}

fn parse_timestamp(value: &str) -> std::result::Result<Timestamp, jiff::Error> {
    value.parse()
}

fn cli() -> Command {
    let codecs: Vec<&'static str> = encodings()
        .iter()
        .filter(|e| e.raw_decoder().is_ascii_compatible())
        .map(|e| e.name())
        .collect();

    Command::new("artifacts")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Salvages events from Windows XML Event Log (EVTX) files, including damaged ones")
        .arg(
            Arg::new("INPUT")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("event-id")
                .short('e')
                .long("event-id")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(u32))
                .help("Only print events with this id. May be repeated."),
        )
        .arg(
            Arg::new("level")
                .short('l')
                .long("level")
                .action(ArgAction::Append)
                .value_parser(|s: &str| s.parse::<Level>())
                .help("Only print events of this level (critical, error, warning, info, verbose). May be repeated."),
        )
        .arg(
            Arg::new("since")
                .long("since")
                .value_parser(parse_timestamp)
                .help("Only print events at or after this RFC3339 time."),
        )
        .arg(
            Arg::new("until")
                .long("until")
                .value_parser(parse_timestamp)
                .help("Only print events before this RFC3339 time."),
        )
        .arg(
            Arg::new("output-format")
                .short('o')
                .long("format")
                .value_parser(["summary", "csv", "json"])
                .default_value("summary")
                .help("Sets the output format")
                .long_help(
                    "Sets the output format:
    \"summary\" - one tab separated line per event.
    \"csv\"     - comma separated values with a header row.
    \"json\"    - one JSON object per line.",
                ),
        )
        .arg(
            Arg::new("num-threads")
                .short('t')
                .long("threads")
                .default_value("0")
                .value_parser(clap::value_parser!(usize))
                .help("Sets the number of worker threads, defaults to number of CPU cores."),
        )
        .arg(
            Arg::new("no-validate-checksums")
                .long("no-validate-checksums")
                .action(ArgAction::SetTrue)
                .help("Trust chunk contents even when their checksums do not match."),
        )
        .arg(
            Arg::new("no-recovery")
                .long("no-recovery")
                .action(ArgAction::SetTrue)
                .help("Do not scan dirty chunks for records beyond the last valid one."),
        )
        .arg(
            Arg::new("ansi-codec")
                .long("ansi-codec")
                .value_parser(PossibleValuesParser::new(codecs))
                .default_value(encoding::all::WINDOWS_1252.name())
                .help("Controls the codec of ansi encoded strings in the file."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("-v - info, -vv - debug, -vvv - trace."),
        )
}

fn main() {
    let matches = cli().get_matches();

    let result = Artifacts::from_cli_matches(&matches).and_then(|artifacts| artifacts.run());
    if let Err(e) = result {
        // A closed pipe (`artifacts file.evtx | head`) is not an error.
        if e
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
        {
            return;
        }
        eprintln!("{e:#}");
        exit(1);
    }
}
