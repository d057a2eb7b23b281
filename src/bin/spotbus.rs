use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use spotrelay::bus::{self, BusFrame};
use spotrelay::clock::{RtcTime, RTC_TIME_SIZE};
use spotrelay::Operation;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "4242";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("spotbus")
        .version("0.1.0")
        .about("🔌 Bus master for a running spot relay")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Relay host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Relay bus port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("sender")
                .about("Set the reporter callsign and grid locator")
                .arg(Arg::with_name("callsign").required(true))
                .arg(Arg::with_name("grid").required(true)),
        )
        .subcommand(
            SubCommand::with_name("software")
                .about("Set the decoding software name")
                .arg(Arg::with_name("name").required(true)),
        )
        .subcommand(
            SubCommand::with_name("spot")
                .about("Report a received station")
                .arg(Arg::with_name("callsign").required(true))
                .arg(
                    Arg::with_name("frequency")
                        .help("Frequency in Hz")
                        .required(true)
                        .validator(|v| match v.parse::<u32>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Frequency must be a whole number of Hz".into()),
                        }),
                )
                .arg(
                    Arg::with_name("snr")
                        .help("Signal-to-noise ratio in dB")
                        .required(true)
                        .allow_hyphen_values(true)
                        .validator(|v| match v.parse::<i8>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("SNR must be between -128 and 127".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("send").about("Request an immediate report"))
        .subcommand(SubCommand::with_name("time").about("Read the relay's time of day"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;

    let frame = match matches.subcommand() {
        ("sender", Some(sub)) => BusFrame::new(
            Operation::SenderRecord,
            &bus::sender_payload(arg(sub, "callsign"), arg(sub, "grid"))?,
        )?,
        ("software", Some(sub)) => BusFrame::new(
            Operation::SenderSoftwareRecord,
            &bus::software_payload(arg(sub, "name"))?,
        )?,
        ("spot", Some(sub)) => BusFrame::new(
            Operation::ReceivedRecord,
            &bus::received_payload(
                arg(sub, "callsign"),
                arg(sub, "frequency").parse()?,
                arg(sub, "snr").parse()?,
            )?,
        )?,
        ("send", _) => BusFrame::new(Operation::SendRequest, &[])?,
        ("time", _) => BusFrame::new(Operation::TimeRequest, &[])?,
        _ => return Err("a subcommand is required".into()),
    };

    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(&frame.to_stream_bytes()).await?;

    if frame.operation == Operation::TimeRequest {
        let mut raw = [0u8; RTC_TIME_SIZE];
        stream.read_exact(&mut raw).await?;
        match RtcTime::from_bytes(&raw).filter(|t| !t.is_zero()) {
            Some(t) => println!(
                "{} 20{:02}-{:02}-{:02} {:02}:{:02}:{:02} (day {})",
                "🕒".green(),
                t.year,
                t.month,
                t.day,
                t.hours,
                t.minutes,
                t.seconds,
                t.day_of_week
            ),
            None => println!("{}", "Relay clock not set".yellow()),
        }
    } else {
        println!("{} {:?} sent to {}:{}", "✓".green(), frame.operation, host, port);
    }
    Ok(())
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.value_of(name).unwrap_or_default()
}
