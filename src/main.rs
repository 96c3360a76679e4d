use ircode_research::*;

use std::path::PathBuf;

use clap::Parser;

/// Decompile p-code into IR-code and research it
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Decompile a textual p-code listing
    Decompile {
        /// Path to a p-code listing (one instruction per line, `<label>:` lines for targets)
        pcode: PathBuf,
        /// Byte offset of a function entry (repeatable; defaults to the first instruction)
        #[clap(long = "entry", parse(try_from_str = parse_offset))]
        entries: Vec<u64>,
        /// Path to output file for the IR-code listing
        #[clap(long)]
        ircode_out: Option<PathBuf>,
        /// Path to output file for the data-flow listing
        #[clap(long)]
        data_flow_out: Option<PathBuf>,
        /// Path to output file for the researched structures
        #[clap(long)]
        structures_out: Option<PathBuf>,
        /// Output the data-flow graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        dot_out: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the research behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineResearchConfig>,
    },
}

fn parse_offset(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Write `text` to `path`, or to stdout without one
fn output(path: Option<PathBuf>, text: &str) -> std::io::Result<()> {
    match path {
        Some(path) => std::fs::write(path, text),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Decompile {
            pcode,
            entries,
            ircode_out,
            data_flow_out,
            structures_out,
            dot_out,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    std::process::exit(1);
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            config::ResearchConfig::initialize(advanced_config);

            let listing = match std::fs::read_to_string(&pcode) {
                Ok(listing) => listing,
                Err(e) => {
                    log::crit!("P-code file could not be read"; "path" => ?pcode, "error" => %e);
                    std::process::exit(1);
                }
            };
            let entries: Vec<pcode::InstructionOffset> = entries
                .into_iter()
                .map(|e| pcode::InstructionOffset::new(e, 0))
                .collect();
            let session = match session::Session::from_listing(&listing, &entries) {
                Ok(session) => session,
                Err(e) => {
                    log::crit!("P-code could not be parsed"; "error" => %e);
                    std::process::exit(1);
                }
            };
            session.decompile();

            let functions = session.functions();
            let ircode = functions
                .iter()
                .map(|f| {
                    format!(
                        "{}:\n{}\n{}",
                        session.program.borrow().function_name(*f),
                        session.dump_signature(*f),
                        session.dump_ircode(*f)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let data_flow = functions
                .iter()
                .map(|f| session.dump_data_flow(*f))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");

            let mut outputs = vec![
                (ircode_out, ircode),
                (data_flow_out, data_flow),
                (structures_out, session.dump_structures()),
            ];
            if let Some(path) = dot_out {
                outputs.push((Some(path), session.dump_dot()));
            }
            for (path, text) in outputs {
                if let Err(e) = output(path, &text) {
                    log::crit!("Output could not be written"; "error" => %e);
                    std::process::exit(1);
                }
            }

            log::trace!("Done");
        }
    }
}
