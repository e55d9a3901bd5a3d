use clap::{Arg, ArgAction, ArgMatches, Command, error::ErrorKind, value_parser};
use log::error;
use nut4nt_dumper::{
    device::{Backend, open_device},
    session::{AcquisitionSupervisor, Completion, DumpDuration, SessionConfig},
    sink::Destination,
};
use status_line::StatusLine;
use std::{
    error::Error,
    path::PathBuf,
    process::{ExitCode, exit},
};

const EXIT_SESSION_FAULT: u8 = 1;
const EXIT_INIT_FAILURE: u8 = 2;

const EXAMPLES: &str = "\
Use 'stdout' as a file name to direct the signal to standard output.

Example (dumping one minute of signal using the cypress driver):
  nut4nt-dump AmungoItsFx3Firmware.img nt1065.hex dump4ch.bin 60 cypress

Example (dumping signal non-stop to stdout):
  nut4nt-dump AmungoItsFx3Firmware.img nt1065.hex stdout inf libusb";

fn command() -> Command {
    Command::new("nut4nt-dump")
        .about("Dump signal from a nut4nt board")
        .after_help(EXAMPLES)
        .arg(
            Arg::new("firmware")
                .value_name("FX3_IMAGE")
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .help("FX3 firmware image"),
        )
        .arg(
            Arg::new("config")
                .value_name("NT1065_CFG")
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .help("NT1065 register configuration"),
        )
        .arg(
            Arg::new("output")
                .value_name("OUT_FILE|stdout")
                .required(true)
                .help("Output file"),
        )
        .arg(
            Arg::new("seconds")
                .value_name("SECONDS|inf")
                .value_parser(|s: &str| s.parse::<DumpDuration>())
                .required(true)
                .help("Seconds to dump, 0 to only test the USB transfer"),
        )
        .arg(
            Arg::new("driver")
                .value_name("cypress|libusb")
                .value_parser(|s: &str| s.parse::<Backend>())
                .required(true)
                .help("Driver backend"),
        )
        .arg(
            Arg::new("regdump")
                .long("regdump")
                .value_parser(value_parser!(PathBuf))
                .default_value("regdump.txt")
                .help("Register log file"),
        )
        .arg(
            Arg::new("noise")
                .long("noise")
                .action(ArgAction::SetTrue)
                .help("Report the USB noise level even when dumping"),
        )
}

fn session_config(matches: &ArgMatches) -> Option<(SessionConfig, Backend)> {
    let output = matches.get_one::<String>("output")?;
    let duration = *matches.get_one::<DumpDuration>("seconds")?;
    let backend = *matches.get_one::<Backend>("driver")?;

    let mut config = SessionConfig::new(Destination::from(output.as_str()), duration);
    config.report_noise |= matches.get_flag("noise");
    config.register_log = matches.get_one::<PathBuf>("regdump")?.clone();
    Some((config, backend))
}

fn dump(supervisor: &mut AcquisitionSupervisor) -> Result<Completion, Box<dyn Error>> {
    let flag = supervisor.run_flag();
    ctrlc::set_handler(move || {
        if !flag.is_running() {
            eprintln!("Killing...");
            exit(-1);
        }
        flag.interrupt();
    })?;

    let status = StatusLine::new(supervisor.progress());
    let result = supervisor.run();
    drop(status);
    Ok(result?.completion)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    eprintln!("*** Amungo's dumper for nut4nt board ***");
    eprintln!();

    let matches = match command().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            if !matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                eprintln!();
                eprintln!("{EXAMPLES}");
            }
            return ExitCode::SUCCESS;
        }
    };
    let Some((config, backend)) = session_config(&matches) else {
        let _ = command().print_help();
        return ExitCode::SUCCESS;
    };
    let firmware = matches.get_one::<PathBuf>("firmware").cloned().unwrap_or_default();
    let channel_config = matches.get_one::<PathBuf>("config").cloned().unwrap_or_default();

    eprintln!("------------------------------");
    match config.duration {
        DumpDuration::Unbounded => eprintln!("Dump non-stop to {}", config.destination),
        d if d.is_zero() => eprintln!("No dumping - just testing!"),
        d => eprintln!("Dump {} to {}", d, config.destination),
    }
    eprintln!(
        "Using fx3 image from '{}' and nt1065 config from '{}'",
        firmware.display(),
        channel_config.display()
    );
    eprintln!("You chose to use the __{backend}__ driver");
    eprintln!("Session started {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    eprintln!("------------------------------");

    eprintln!("Wait while device is being initialized...");
    let device = open_device(backend);
    if let Err(e) = device.init(&firmware, &channel_config) {
        error!("problems with hardware or driver type: {e}");
        return ExitCode::from(EXIT_INIT_FAILURE);
    }
    eprintln!("Device was initialized.");

    let mut supervisor = AcquisitionSupervisor::new(device, config);
    match dump(&mut supervisor) {
        Ok(Completion::Done) => {
            eprintln!("Dump done");
            ExitCode::SUCCESS
        }
        Ok(Completion::Interrupted) => {
            eprintln!("Stopped by user");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_SESSION_FAULT)
        }
    }
}
