use std::{error::Error, io};

use apc::cli::{Cli, run};
use clap::Parser;
use crossbeam::channel;

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; RUST_LOG selects verbosity
    env_logger::init();

    let cli = Cli::parse();
    let (interrupt_tx, interrupt_rx) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })?;

    run(&cli, &interrupt_rx, &mut io::stdout().lock())?;
    Ok(())
}
