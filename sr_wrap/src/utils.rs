use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use sr_lib::controller::error_chain;
use std::io::Write;

/// Convert an io::error to a string and strip "(os error 2)" from the end.
fn io_error_to_string(err: &std::io::Error) -> String {
    let s = err.to_string();
    s.strip_suffix(&format!(" (os error {})", err.raw_os_error().unwrap_or(0)))
        .unwrap_or(&s)
        .to_string()
}

/// Format an error chain for the terminal, one cause per line.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let chain = error_chain(err);
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        let io_err_str = io_error_to_string(io_err);
        match err.chain().len() {
            1 => format!("ERROR: {io_err_str}"),
            2 => format!("ERROR: {io_err_str}: {err}"),
            _ => format!("ERROR: {chain}"),
        }
    } else {
        format!("ERROR: {chain}")
    }
}

/// Print an error chain.
pub fn print_error_chain(err: &anyhow::Error) {
    eprintln!("{}", format_error_chain(err));
}

pub fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the logger. `RUST_LOG` overrides the level given by `verbose`.
pub fn init_logging(verbose: u8) {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log_level(verbose))
        .parse_default_env()
        .init();
}
