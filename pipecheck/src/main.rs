use core::error::Error;

use clap::Parser;
use pipecheck::{cfg::Config, cmd::Cmd, runtime::Runtime};
use tokio::runtime::Builder;

pub fn main() {
    let cmd = Cmd::parse();
    pipecheck::logging::init(cmd.verbose as usize).unwrap();

    match run(cmd) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    }
}

fn run(cmd: Cmd) -> Result<bool, Box<dyn Error>> {
    let cfg: Config = cmd.try_into()?;

    // Init I/O runtime.
    let outcome = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .thread_name("runtime")
        .build()?
        .block_on(async {
            let runtime = Runtime::new(cfg);

            runtime.run().await
        })?;
    log::debug!(
        "{} failed, {} compromised",
        outcome.failed,
        outcome.compromised
    );

    Ok(outcome.is_success())
}
