// Command line tool for inspecting msgpack payloads.
//
// Subcommands read their input from a file, stdin, or a hex string given on
// the command line. Diagnostics go to stderr; decoded output to stdout.

use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

use crate::encoder::DEFAULT_MAX_DEPTH as DEFAULT_GRAPH_DEPTH;
use crate::msgpack::{self, Reader};
use crate::msgpack::decoder::DEFAULT_MAX_DEPTH;

// ---------------------------------------------------------------------------
// Hex input parsing
// ---------------------------------------------------------------------------

/// Parse hex digits, ignoring whitespace and an optional `0x` prefix.
fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{s}'"));
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("invalid hex digits in '{s}'"));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| format!("invalid hex digits in '{s}'"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Schema delta toolkit.
#[derive(Parser, Debug)]
#[command(
    name = "schemadelta",
    version,
    about = "Inspect msgpack payloads used by schemadelta buffers",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Decode every msgpack value in the input and print it as JSON.
    Value(ValueArgs),
    /// Report whether the next value is string-class or number-class.
    Peek(InputArgs),
    /// Print build/configuration details.
    Config,
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Input bytes as hex instead of a file.
    #[arg(long, conflicts_with = "input")]
    hex: Option<String>,

    /// Start decoding at this byte offset.
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Input file (default: stdin).
    #[arg(value_hint = ValueHint::FilePath)]
    input: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValueArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Pretty-print each value.
    #[arg(long)]
    pretty: bool,

    /// Maximum array/map nesting.
    #[arg(long = "max-depth", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Stop after the first value.
    #[arg(long)]
    first: bool,
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Value,
    Peek,
    Config,
}

#[derive(Debug)]
struct Options {
    command: Command,
    quiet: bool,
    verbose: u8,
    hex: Option<String>,
    input_file: Option<PathBuf>,
    offset: usize,
    pretty: bool,
    max_depth: usize,
    first: bool,
}

fn resolve_options(cli: Cli) -> Options {
    let quiet = cli.quiet;
    let verbose = cli.verbose.min(2);
    let base = |command, input: InputArgs| Options {
        command,
        quiet,
        verbose,
        hex: input.hex,
        input_file: input.input,
        offset: input.offset,
        pretty: false,
        max_depth: DEFAULT_MAX_DEPTH,
        first: false,
    };

    match cli.command {
        Cmd::Value(args) => Options {
            pretty: args.pretty,
            max_depth: args.max_depth,
            first: args.first,
            ..base(Command::Value, args.input)
        },
        Cmd::Peek(input) => base(Command::Peek, input),
        Cmd::Config => base(
            Command::Config,
            InputArgs {
                hex: None,
                offset: 0,
                input: None,
            },
        ),
    }
}

fn log_filter(opts: &Options) -> &'static str {
    if opts.quiet {
        return "error";
    }
    match opts.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

fn read_input(opts: &Options) -> Result<Vec<u8>, String> {
    if let Some(hex) = &opts.hex {
        return parse_hex(hex);
    }
    match &opts.input_file {
        Some(path) => {
            std::fs::read(path).map_err(|e| format!("input file: {}: {e}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .map_err(|e| format!("stdin: {e}"))?;
            Ok(buf)
        }
    }
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("schemadelta version {version}");
    eprintln!("CLI={}", cfg!(feature = "cli") as u8);
    eprintln!("MSGPACK_MAX_DEPTH={DEFAULT_MAX_DEPTH}");
    eprintln!("GRAPH_MAX_DEPTH={DEFAULT_GRAPH_DEPTH}");
    eprintln!("END_OF_STRUCTURE={:#04x}", crate::changes::END_OF_STRUCTURE);
    eprintln!("sizeof(usize)={}", std::mem::size_of::<usize>());
    0
}

// ---------------------------------------------------------------------------
// Value command
// ---------------------------------------------------------------------------

fn cmd_value(opts: &Options) -> i32 {
    let bytes = match read_input(opts) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("schemadelta: {e}");
            return 1;
        }
    };
    if opts.offset > bytes.len() {
        eprintln!(
            "schemadelta: offset {} is past the end of the input ({} bytes)",
            opts.offset,
            bytes.len()
        );
        return 1;
    }

    let mut reader = Reader::with_offset(&bytes, opts.offset).with_max_depth(opts.max_depth);
    let mut out = BufWriter::new(io::stdout().lock());
    let mut count = 0usize;
    while !reader.is_empty() {
        let start = reader.offset();
        let value = match reader.read_value() {
            Ok(v) => v,
            Err(e) => {
                let _ = out.flush();
                eprintln!("schemadelta: decode error at offset {start}: {e}");
                return 1;
            }
        };
        let json = serde_json::Value::from(value);
        let text = if opts.pretty {
            serde_json::to_string_pretty(&json)
        } else {
            serde_json::to_string(&json)
        };
        let written = match text {
            Ok(t) => writeln!(out, "{t}"),
            Err(e) => {
                eprintln!("schemadelta: {e}");
                return 1;
            }
        };
        if let Err(e) = written {
            eprintln!("schemadelta: write error: {e}");
            return 1;
        }
        log::debug!("value {count}: offset {start}..{}", reader.offset());
        count += 1;
        if opts.first {
            break;
        }
    }
    if let Err(e) = out.flush() {
        eprintln!("schemadelta: write flush error: {e}");
        return 1;
    }
    if opts.verbose > 0 && !opts.quiet {
        eprintln!("schemadelta: {count} values, {} bytes read", reader.offset() - opts.offset);
    }
    0
}

// ---------------------------------------------------------------------------
// Peek command
// ---------------------------------------------------------------------------

fn peek_class(bytes: &[u8], offset: usize) -> &'static str {
    if msgpack::string_check(bytes, offset) {
        "string"
    } else if msgpack::int_check(bytes, offset) {
        "number"
    } else if offset >= bytes.len() {
        "end"
    } else {
        "other"
    }
}

fn cmd_peek(opts: &Options) -> i32 {
    let bytes = match read_input(opts) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("schemadelta: {e}");
            return 1;
        }
    };
    let class = peek_class(&bytes, opts.offset);
    match bytes.get(opts.offset) {
        Some(b) if !opts.quiet => println!("{class} ({b:#04x})"),
        _ => println!("{class}"),
    }
    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(&opts)))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match opts.command {
        Command::Value => cmd_value(&opts),
        Command::Peek => cmd_peek(&opts),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
