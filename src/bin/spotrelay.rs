use clap::{App, Arg};
use colored::*;
use spotrelay::bus::{self, BusPayload};
use spotrelay::config::RelayConfig;
use spotrelay::reporter::{session_id, ReportAggregator};
use spotrelay::transport::LinkState;
use spotrelay::{
    BusBridge, Clock, Endpoint, Operation, Outcome, RecordingTransport, RelayAgent, SystemClock,
    Transport, UdpTransport,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_BUS_PORT: &str = "4242";
const TICK_PERIOD_MS: u64 = 10;
const LINK_CHECK_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("spotrelay")
        .version("0.1.0")
        .about("📻 Spot relay - forwards received spots to the aggregation service")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("test-mode")
                .short("t")
                .long("test-mode")
                .help("Report to the test port"),
        )
        .arg(
            Arg::with_name("mac")
                .long("mac")
                .value_name("MAC")
                .help("Hardware address used to derive the session id (aa:bb:cc:dd:ee:ff)")
                .takes_value(true)
                .validator(|v| match parse_mac(&v) {
                    Some(_) => Ok(()),
                    None => Err("MAC must be six hex bytes separated by ':'".into()),
                }),
        )
        .arg(
            Arg::with_name("bus-port")
                .short("p")
                .long("bus-port")
                .value_name("PORT")
                .help("TCP port emulating the peripheral bus")
                .takes_value(true)
                .default_value(DEFAULT_BUS_PORT),
        )
        .arg(
            Arg::with_name("demo")
                .long("demo")
                .help("Inject a test sequence of spots and send it"),
        )
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .help("Record datagrams instead of sending them"),
        )
        .get_matches();

    tracing_subscriber::fmt::init();

    let mut config = match matches.value_of("config") {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if matches.is_present("test-mode") {
        config.test_mode = true;
    }
    let mac = matches.value_of("mac").and_then(parse_mac);
    let session = session_id(&mac);
    let bus_port = matches.value_of("bus-port").unwrap_or(DEFAULT_BUS_PORT).parse::<u16>()?;

    println!("{}", "📻 Spot Relay".bright_blue().bold());
    println!("{}", "=============".bright_blue());
    println!("   Endpoint:    {}", config.endpoint().to_string().bright_cyan());
    println!("   Session id:  {}", format!("{:08x}", session).bright_cyan());
    println!("   Bus address: {}", format!("0x{:02x}", config.bus_address).bright_cyan());
    println!("   Bus port:    {}", bus_port.to_string().bright_cyan());
    if config.test_mode {
        println!("   {}", "Test mode".yellow());
    }

    if matches.is_present("dry-run") {
        let transport = RecordingTransport::new();
        let reporter = ReportAggregator::from_config(&config, session, transport.clone(), SystemClock);
        let agent = RelayAgent::new(config, reporter);
        run(agent, bus_port, matches.is_present("demo"), move || {
            for datagram in transport.take_sent() {
                info!("dry run datagram for {}: {} bytes", datagram.endpoint, datagram.bytes.len());
            }
        })
        .await
    } else {
        let transport = UdpTransport::bind()?;
        tokio::spawn(monitor_link(transport.link(), config.endpoint()));
        let reporter = ReportAggregator::from_config(&config, session, transport, SystemClock);
        let agent = RelayAgent::new(config, reporter);
        run(agent, bus_port, matches.is_present("demo"), || {}).await
    }
}

/// Treats the network as up while the report endpoint resolves.
async fn monitor_link(link: LinkState, endpoint: Endpoint) {
    let mut interval = time::interval(Duration::from_secs(LINK_CHECK_SECS));
    loop {
        interval.tick().await;
        let up = match tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await {
            Ok(mut addrs) => addrs.any(|addr| addr.is_ipv4()),
            Err(_) => false,
        };
        if up != link.is_connected() {
            if up {
                info!("🌐 network up, {} reachable", endpoint);
            } else {
                warn!("network down, cannot resolve {}", endpoint);
            }
            link.set_connected(up);
        }
    }
}

async fn run<T: Transport, C: Clock>(
    mut agent: RelayAgent<T, C>,
    bus_port: u16,
    demo: bool,
    mut after_send: impl FnMut(),
) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = agent.bridge();
    let listener = TcpListener::bind(("127.0.0.1", bus_port)).await?;
    info!("🔌 bus emulation listening on port {}", bus_port);
    let bus_server = tokio::spawn(serve_bus(listener, bridge.clone()));

    if demo {
        inject_demo(&bridge)?;
    }

    let started = Instant::now();
    let mut interval = time::interval(Duration::from_millis(TICK_PERIOD_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let now_ms = started.elapsed().as_millis() as u64;
        if let Some(dispatch) = agent.tick(now_ms) {
            if let Outcome::Sent(report) = &dispatch.outcome {
                println!(
                    "{} report #{} with {} spots ({} bytes)",
                    "📡".green(),
                    report.sequence_number,
                    report.records,
                    report.bytes_written
                );
                after_send();
            }
        }
    }

    bus_server.abort();
    let stats = agent.stats();
    println!("{}", "🛑 Spot relay stopped".bright_blue());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Queues the reference sequence: reporter identity, software, ten spots
/// and a send request.
fn inject_demo(bridge: &BusBridge) -> Result<(), Box<dyn std::error::Error>> {
    let post = |operation: Operation, payload: &BusPayload| {
        let mut transaction = vec![operation as u8];
        transaction.extend_from_slice(payload);
        if bridge.on_receive(&transaction).is_none() {
            warn!("demo {:?} was dropped", operation);
        }
    };

    post(Operation::SenderRecord, &bus::sender_payload("G8KIG", "IO91iq")?);
    post(
        Operation::SenderSoftwareRecord,
        &bus::software_payload("DX FT8 Transceiver (Test)")?,
    );
    for idx in 0..10u8 {
        let callsign = format!("G8KIG-{}", idx);
        let frequency = 14_031 + u32::from(idx);
        let snr = 127 - idx as i8;
        post(
            Operation::ReceivedRecord,
            &bus::received_payload(&callsign, frequency, snr)?,
        );
    }
    post(Operation::SendRequest, &BusPayload::new());
    info!("demo sequence queued");
    Ok(())
}

async fn serve_bus(listener: TcpListener, bridge: BusBridge) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 bus master connected: {}", addr);
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_master(stream, bridge).await {
                        warn!("bus master {} error: {}", addr, e);
                    }
                    info!("bus master {} disconnected", addr);
                });
            }
            Err(e) => error!("failed to accept bus connection: {}", e),
        }
    }
}

/// Reads length-prefixed transactions until the master hangs up. A time
/// request is answered with the current time of day.
async fn handle_master(mut stream: TcpStream, bridge: BusBridge) -> std::io::Result<()> {
    let mut buf = [0u8; u8::MAX as usize];
    loop {
        let len = match stream.read_u8().await {
            Ok(len) => usize::from(len),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let transaction = &mut buf[..len];
        stream.read_exact(transaction).await?;

        if transaction.first() == Some(&(Operation::TimeRequest as u8))
            && transaction.len() == 1
        {
            stream.write_all(&bridge.on_request()).await?;
        } else {
            bridge.on_receive(transaction);
        }
    }
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
