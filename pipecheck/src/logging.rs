//! Diagnostics go to stderr; stdout carries the check results.

use std::{error::Error, io};

use crossterm::tty::IsTty;
use log::LevelFilter;
use simple_logger::SimpleLogger;

/// Crates of the transport stack whose logs are only shown at the highest
/// verbosity.
const TRANSPORT_MODULES: [&str; 4] = ["quinn", "h3", "h3_quinn", "rustls"];

/// Log levels of this crate and of the transport stack for the number of
/// `-v` flags.
fn levels(verbosity: usize) -> (LevelFilter, LevelFilter) {
    match verbosity {
        0 => (LevelFilter::Info, LevelFilter::Off),
        1 => (LevelFilter::Debug, LevelFilter::Off),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Debug),
    }
}

pub fn init(verbosity: usize) -> Result<(), Box<dyn Error>> {
    let (own, transport) = levels(verbosity);

    let mut logger = SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level("pipecheck", own)
        .with_colors(io::stderr().is_tty())
        .with_utc_timestamps();
    for module in TRANSPORT_MODULES {
        logger = logger.with_module_level(module, transport);
    }
    logger.init()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!((LevelFilter::Info, LevelFilter::Off), levels(0));
        assert_eq!((LevelFilter::Debug, LevelFilter::Off), levels(1));
        assert_eq!((LevelFilter::Trace, LevelFilter::Warn), levels(2));
        assert_eq!((LevelFilter::Trace, LevelFilter::Debug), levels(3));
        assert_eq!(levels(3), levels(8));
    }
}
