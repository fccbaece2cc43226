use anyhow::Result;
use clap::Parser;
use emesa::{control, logger, Config, Machine};

#[derive(Parser)]
#[command(name = "guam", about = "Pilot/Mesa workstation emulator")]
struct Args {
    /// machine configuration file
    config: String,
    /// configuration entry to run
    entry: String,
    /// record control transfers
    #[arg(long)]
    trace: bool,
    /// run without a display window
    #[arg(long)]
    no_display: bool,
    /// interactive command console instead of booting directly
    #[arg(long)]
    console: bool,
    /// halt when the guest writes this maintenance panel code
    #[arg(long)]
    stop_at_mp: Option<u16>,
    /// suppress log output until this maintenance panel code
    #[arg(long)]
    log_at_mp: Option<u16>,
}

fn main() -> Result<()> {
    logger::initialize();
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let entry = config.entry(&args.entry)?.clone();

    let mut machine = Machine::build(entry, args.no_display)?;
    if args.trace {
        machine.processor.trace.set_enabled(true);
    }
    if let Some(mp) = args.stop_at_mp {
        let stop = machine.stop.clone();
        machine.processor.add_mp_observer(logger::mp_stop_at(mp, stop));
    }
    if let Some(mp) = args.log_at_mp {
        machine.processor.add_mp_observer(logger::mp_log_gate(mp));
    }

    if args.console {
        control::console(&mut machine);
        machine.shutdown();
    } else {
        machine.boot()?;
        machine.run();
    }

    if machine.processor.trace.enabled() {
        println!("{}", machine.processor.opcodes.stats());
    }
    Ok(())
}
